use std::path::PathBuf;
use std::process;

use anydsl_runtime::{
    CudaDeviceFeatures, DeviceFeatures, DeviceInfo, DeviceType, GetDeviceRequest, Runtime, RuntimeConfig,
};
use anydsl_tracing::TracingConfig;
use clap::Parser;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "anydsl-inspector", version, about = "List the devices visible to the AnyDSL runtime")]
struct Cli {
    /// Print a JSON report instead of text
    #[arg(long)]
    json: bool,
    /// Compilation cache directory (default: ANYDSL_CACHE_DIR or <exe dir>/cache)
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,
    /// Skip CUDA even when it is available
    #[arg(long)]
    no_cuda: bool,
}

#[derive(Serialize)]
struct Report {
    version: String,
    has_jit: bool,
    devices: Vec<DeviceReport>,
}

#[derive(Serialize)]
struct DeviceReport {
    device_type: String,
    device_number: u32,
    name: String,
    version: u32,
    is_host: bool,
    total_memory: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cuda: Option<CudaReport>,
}

#[derive(Serialize)]
struct CudaReport {
    free_memory: u64,
    max_threads_per_block: u32,
    max_block_dim: [u32; 3],
    max_grid_dim: [u32; 3],
    max_shared_mem_per_block: u32,
    max_registers_per_block: u32,
}

impl From<&CudaDeviceFeatures> for CudaReport {
    fn from(features: &CudaDeviceFeatures) -> Self {
        Self {
            free_memory: features.free_memory,
            max_threads_per_block: features.max_threads_per_block,
            max_block_dim: features.max_block_dim,
            max_grid_dim: features.max_grid_dim,
            max_shared_mem_per_block: features.max_shared_mem_per_block,
            max_registers_per_block: features.max_registers_per_block,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Text mode only; JSON output must stay clean.
    if !cli.json {
        if let Err(err) = anydsl_tracing::init_global_tracing(&TracingConfig::from_env()) {
            eprintln!("warning: {err}");
        }
    }

    let mut config = RuntimeConfig::from_env();
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = Some(dir);
    }
    if cli.no_cuda {
        config.enable_cuda = false;
    }

    let report = match Runtime::new(config).and_then(|runtime| inspect(&runtime)) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(1);
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("error: cannot serialize report: {err}");
                process::exit(1);
            }
        }
    } else {
        print_text(&report);
    }
}

fn inspect(runtime: &Runtime) -> anydsl_runtime::Result<Report> {
    let count = runtime.count_devices();
    let mut devices = Vec::with_capacity(count);
    for info in runtime.list_devices(count)? {
        let cuda = match info.device_type {
            DeviceType::Cuda => Some(cuda_features(runtime, &info)?),
            _ => None,
        };
        devices.push(DeviceReport {
            device_type: info.device_type.name().to_string(),
            device_number: info.device_number,
            name: info.name,
            version: info.version,
            is_host: info.is_host,
            total_memory: info.total_memory,
            cuda,
        });
    }

    Ok(Report {
        version: Runtime::version().to_string(),
        has_jit: runtime.features().has_jit,
        devices,
    })
}

fn cuda_features(runtime: &Runtime, info: &DeviceInfo) -> anydsl_runtime::Result<CudaReport> {
    let device = runtime.get_device(&GetDeviceRequest::new(info.device_type, info.device_number))?;
    let mut features = DeviceFeatures::default();
    features.next.push(CudaDeviceFeatures::default());
    runtime.get_device_features(device, &mut features)?;
    Ok(features
        .next
        .get::<CudaDeviceFeatures>()?
        .map(CudaReport::from)
        .unwrap_or_else(|| CudaReport::from(&CudaDeviceFeatures::default())))
}

fn print_text(report: &Report) {
    println!("AnyDSL runtime {} (jit: {})", report.version, if report.has_jit { "yes" } else { "no" });
    println!("{} device(s)", report.devices.len());
    for device in &report.devices {
        println!();
        println!("[{} {}] {}", device.device_type, device.device_number, device.name);
        println!("  version:      {}", device.version);
        println!("  host:         {}", device.is_host);
        println!("  total memory: {} MiB", device.total_memory / (1024 * 1024));
        if let Some(cuda) = &device.cuda {
            println!("  free memory:  {} MiB", cuda.free_memory / (1024 * 1024));
            println!("  max threads per block:    {}", cuda.max_threads_per_block);
            println!("  max block dim:            {:?}", cuda.max_block_dim);
            println!("  max grid dim:             {:?}", cuda.max_grid_dim);
            println!("  max shared mem per block: {}", cuda.max_shared_mem_per_block);
            println!("  max registers per block:  {}", cuda.max_registers_per_block);
        }
    }
}

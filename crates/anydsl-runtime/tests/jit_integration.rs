//! JIT modules through the runtime, with an in-process code generator.

use std::ffi::c_void;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anydsl_runtime::jit::{CodeGenerator, CodeImage, CodegenFailure, CodegenRequest, GeneratedCode};
use anydsl_runtime::{
    CompileLanguages, JitCompileOptions, JitCompileResult, JitLinkInfo, JitLookupInfo, JitManager, ModuleHandle,
    Result, ResultCode, Runtime, RuntimeConfig, RuntimeError,
};
use serial_test::serial;
use tempfile::TempDir;

/// Symbol `name` lives at address `position + 1` of the program's words.
struct SymbolTable(Vec<String>);

impl CodeImage for SymbolTable {
    fn symbol(&self, name: &str) -> Option<*const c_void> {
        self.0
            .iter()
            .position(|word| word == name)
            .map(|index| (index + 1) as *const c_void)
    }
}

#[derive(Default)]
struct TableGenerator {
    runs: AtomicUsize,
}

impl CodeGenerator for TableGenerator {
    fn target_tag(&self) -> String {
        "table-v1".to_string()
    }

    fn image_extension(&self) -> &str {
        ".tbl"
    }

    fn languages(&self) -> CompileLanguages {
        CompileLanguages::ARTIC | CompileLanguages::IMPALA
    }

    fn generate(&self, request: &CodegenRequest<'_>) -> std::result::Result<GeneratedCode, CodegenFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if request.program.contains("@fail") {
            return Err(CodegenFailure::new("unexpected '@'", "1:1: unexpected '@'"));
        }

        let device_code = request
            .program
            .contains("kernel")
            .then(|| vec![(".nvvm".to_string(), b"; nvvm".to_vec())])
            .unwrap_or_default();
        Ok(GeneratedCode {
            host_image: request.program.as_bytes().to_vec(),
            device_code,
            log: format!("-O{} {}", request.opt_level, request.module_name),
        })
    }

    fn load(&self, _module_name: &str, image: &[u8]) -> Result<Box<dyn CodeImage>> {
        let words = String::from_utf8_lossy(image)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Ok(Box::new(SymbolTable(words)))
    }
}

fn jit_runtime(dir: &Path) -> Result<(Runtime, Arc<TableGenerator>)> {
    let generator = Arc::new(TableGenerator::default());
    let mut config = RuntimeConfig::default().with_cache_dir(dir);
    config.enable_cuda = false;
    let runtime = Runtime::with_generator(config, Some(Arc::clone(&generator) as Arc<dyn CodeGenerator>))?;
    Ok((runtime, generator))
}

fn lookup(runtime: &Runtime, module: ModuleHandle, name: &str) -> Result<*const c_void> {
    let mut info = JitLookupInfo::default();
    runtime.lookup_jit(module, name, &mut info)?;
    Ok(info.function)
}

#[test]
fn test_features_report_jit() -> Result<()> {
    let dir = TempDir::new()?;
    let (runtime, _) = jit_runtime(dir.path())?;
    let features = runtime.features();
    assert!(features.has_jit);
    assert!(features.supported_languages.contains(CompileLanguages::IMPALA));
    Ok(())
}

#[test]
fn test_compile_lookup_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let (runtime, generator) = jit_runtime(dir.path())?;
    let program = "main helper";

    let mut result = JitCompileResult::default();
    let first = runtime.compile_jit(program, &JitCompileOptions::default(), Some(&mut result))?;
    assert_eq!(result.module, first);
    assert_eq!(result.log_output, format!("-O3 {}", JitManager::module_name(program)));
    runtime.free_jit_compile_result(&mut result)?;
    assert!(result.log_output.is_empty());

    // Same program again: served from the cache.
    let second = runtime.compile_jit(program, &JitCompileOptions::default(), None)?;
    assert_eq!(generator.runs.load(Ordering::SeqCst), 1);

    assert_eq!(lookup(&runtime, first, "main")?, 1 as *const c_void);
    assert_eq!(lookup(&runtime, second, "helper")?, 2 as *const c_void);

    let err = lookup(&runtime, first, "missing").unwrap_err();
    assert_eq!(err.code(), ResultCode::JitNoFunction);
    Ok(())
}

#[test]
fn test_cache_survives_runtime_restart() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let (runtime, generator) = jit_runtime(dir.path())?;
        runtime.compile_jit("entry", &JitCompileOptions::default(), None)?;
        assert_eq!(generator.runs.load(Ordering::SeqCst), 1);
    }

    let (runtime, generator) = jit_runtime(dir.path())?;
    let module = runtime.compile_jit("entry", &JitCompileOptions::default(), None)?;
    assert_eq!(generator.runs.load(Ordering::SeqCst), 0);
    assert!(!lookup(&runtime, module, "entry")?.is_null());
    Ok(())
}

#[test]
fn test_lookup_after_destroy_fails() -> Result<()> {
    let dir = TempDir::new()?;
    let (runtime, _) = jit_runtime(dir.path())?;
    let module = runtime.compile_jit("entry", &JitCompileOptions::default(), None)?;

    runtime.destroy_jit_module(module)?;
    let err = lookup(&runtime, module, "entry").unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidHandle(_)));
    assert_eq!(runtime.jit().module_count(), 0);
    Ok(())
}

#[test]
fn test_failed_compile_returns_log() -> Result<()> {
    let dir = TempDir::new()?;
    let (runtime, _) = jit_runtime(dir.path())?;

    let mut result = JitCompileResult::default();
    let err = runtime
        .compile_jit("@fail", &JitCompileOptions::default(), Some(&mut result))
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::JitError);
    assert_eq!(result.log_output, "1:1: unexpected '@'");
    assert!(result.module.is_null());
    Ok(())
}

#[test]
fn test_device_code_registered_for_kernel_loader() -> Result<()> {
    let dir = TempDir::new()?;
    let (runtime, _) = jit_runtime(dir.path())?;
    let program = "kernel entry";
    runtime.compile_jit(program, &JitCompileOptions::default(), None)?;

    let name = format!("{}.nvvm", JitManager::module_name(program));
    assert!(runtime.cache().is_registered(Path::new(&name)));
    assert_eq!(runtime.cache().load_file(Path::new(&name))?, b"; nvvm");
    Ok(())
}

#[test]
fn test_per_call_cache_dir_is_restored() -> Result<()> {
    let dir = TempDir::new()?;
    let scratch = TempDir::new()?;
    let (runtime, generator) = jit_runtime(dir.path())?;

    let options = JitCompileOptions {
        cache_dir: Some(scratch.path().to_path_buf()),
        ..Default::default()
    };
    runtime.compile_jit("entry", &options, None)?;
    assert_eq!(runtime.cache().directory(), dir.path());

    // The entry went to the scratch directory, not the runtime one.
    runtime.compile_jit("entry", &JitCompileOptions::default(), None)?;
    assert_eq!(generator.runs.load(Ordering::SeqCst), 2);
    runtime.compile_jit("entry", &options, None)?;
    assert_eq!(generator.runs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn test_invalid_options() -> Result<()> {
    let dir = TempDir::new()?;
    let (runtime, generator) = jit_runtime(dir.path())?;

    let cases = [
        ("entry", JitCompileOptions { opt_level: 4, ..Default::default() }),
        ("entry", JitCompileOptions { log_level: 5, ..Default::default() }),
        ("", JitCompileOptions::default()),
    ];
    for (program, options) in cases {
        let err = runtime.compile_jit(program, &options, None).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidValue(_)));
    }
    assert_eq!(generator.runs.load(Ordering::SeqCst), 0);

    let module = runtime.compile_jit("entry", &JitCompileOptions::default(), None)?;
    let err = runtime.link_jit(module, &[]).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidValue(_)));
    Ok(())
}

#[test]
#[serial]
fn test_link_missing_library_is_jit_error() -> Result<()> {
    let dir = TempDir::new()?;
    let (runtime, _) = jit_runtime(dir.path())?;
    let err = runtime
        .link_jit(ModuleHandle::NULL, &[JitLinkInfo::new(dir.path().join("libmissing.so"))])
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::JitError);
    Ok(())
}

#[test]
fn test_without_generator_everything_is_unsupported() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = RuntimeConfig::default().with_cache_dir(dir.path());
    config.enable_cuda = false;
    let runtime = Runtime::with_generator(config, None)?;

    assert!(!runtime.features().has_jit);
    let err = runtime.compile_jit("entry", &JitCompileOptions::default(), None).unwrap_err();
    assert!(matches!(err, RuntimeError::NotSupported(_)));
    let err = lookup(&runtime, ModuleHandle::NULL, "entry").unwrap_err();
    assert!(matches!(err, RuntimeError::NotSupported(_)));
    Ok(())
}

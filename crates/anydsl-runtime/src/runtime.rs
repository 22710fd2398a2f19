//! Runtime registry
//!
//! [`Runtime`] owns the platforms, the handle tables and the shared
//! services (compilation cache, diagnostics, JIT). Every public method
//! validates its handles and structure tags before touching a backend, and
//! every error it returns is also published on the diagnostics channel.
//!
//! ```text
//! DeviceHandle ──▶ devices  (fixed after construction)
//! BufferHandle ──▶ buffers  RwLock<HandleTable>  ──▶ Arc<dyn Buffer> + owning DeviceId
//! EventHandle  ──▶ events   RwLock<HandleTable>  ──▶ Arc<dyn Event>  + owning DeviceId
//! ModuleHandle ──▶ JitManager
//! ```
//!
//! The null device handle stands for the host device.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use anydsl_tracing::perf_span;
use bytemuck::Pod;
use parking_lot::RwLock;

use crate::backend::{copy_between, Buffer, Device, DeviceId, Event, EventStatus, Platform};
use crate::backends::create_platforms;
use crate::cache::CompilationCache;
use crate::chain::{expect, expect_mut};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::handle::{BufferHandle, DeviceHandle, EventHandle, HandleTable, ModuleHandle};
use crate::jit::{CodeGenerator, CommandCodegen, JitManager};
use crate::log::{Diagnostics, LogCallbackHandle, LogLevel, LogReportCallbackCreateInfo};
use crate::types::{
    BufferCopy, CreateBufferInfo, CreateEventInfo, DeviceFeatures, DeviceHandleInfo, DeviceInfo, DeviceOptions,
    DeviceType, Features, GetBufferPointerInfo, GetDeviceRequest, JitCompileOptions, JitCompileResult, JitLinkInfo,
    JitLookupInfo, LaunchKernelInfo, Options, QueryEventInfo, Version,
};

/// Runtime API version
pub const VERSION: Version = Version {
    major: 2,
    minor: 0,
    patch: 0,
};

struct BufferEntry {
    buffer: Arc<dyn Buffer>,
    device: Arc<dyn Device>,
}

struct EventEntry {
    event: Arc<dyn Event>,
    device: DeviceId,
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

pub struct Runtime {
    config: RuntimeConfig,
    platforms: Vec<Box<dyn Platform>>,
    devices: HandleTable<DeviceHandle, Arc<dyn Device>>,
    device_handles: HashMap<DeviceId, DeviceHandle>,
    host: DeviceHandle,
    buffers: RwLock<HandleTable<BufferHandle, BufferEntry>>,
    events: RwLock<HandleTable<EventHandle, EventEntry>>,
    cache: Arc<CompilationCache>,
    diagnostics: Arc<Diagnostics>,
    jit: JitManager,
}

impl Runtime {
    /// Build a runtime whose JIT uses the compiler named in `config`, if any.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let generator = config.jit_compiler.as_ref().map(|compiler| {
            Arc::new(CommandCodegen::new(compiler, config.jit_compiler_args.clone())) as Arc<dyn CodeGenerator>
        });
        Self::with_generator(config, generator)
    }

    /// Build a runtime with an explicit JIT code generator.
    pub fn with_generator(config: RuntimeConfig, generator: Option<Arc<dyn CodeGenerator>>) -> Result<Self> {
        let cache = Arc::new(CompilationCache::new(config.cache_dir.clone()));
        let diagnostics = Arc::new(Diagnostics::new());
        let platforms = create_platforms(&config, &cache, &diagnostics);
        Self::assemble(config, platforms, cache, diagnostics, generator)
    }

    /// Build a runtime over caller-supplied platforms instead of the
    /// built-in set. One of them must provide the host device.
    #[doc(hidden)]
    pub fn with_platforms(
        config: RuntimeConfig,
        platforms: Vec<Box<dyn Platform>>,
        generator: Option<Arc<dyn CodeGenerator>>,
    ) -> Result<Self> {
        let cache = Arc::new(CompilationCache::new(config.cache_dir.clone()));
        let diagnostics = Arc::new(Diagnostics::new());
        Self::assemble(config, platforms, cache, diagnostics, generator)
    }

    fn assemble(
        config: RuntimeConfig,
        mut platforms: Vec<Box<dyn Platform>>,
        cache: Arc<CompilationCache>,
        diagnostics: Arc<Diagnostics>,
        generator: Option<Arc<dyn CodeGenerator>>,
    ) -> Result<Self> {
        for platform in &mut platforms {
            match platform.init() {
                Ok(()) => tracing::debug!(platform = platform.name(), devices = platform.device_count(), "platform ready"),
                Err(RuntimeError::NotAvailable(reason)) => {
                    tracing::debug!(platform = platform.name(), %reason, "platform not available")
                }
                Err(err) => diagnostics.error(format!("Could not init platform {}: {err}", platform.name())),
            }
        }

        let mut devices = HandleTable::new();
        let mut device_handles = HashMap::new();
        for platform in &platforms {
            for index in 0..platform.device_count() {
                let device = platform.device(index as u32)?;
                let id = device.id();
                device_handles.insert(id, devices.insert(device));
            }
        }
        let host = device_handles
            .get(&DeviceId::HOST)
            .copied()
            .ok_or_else(|| RuntimeError::not_available("host platform has no device"))?;

        let jit = JitManager::new(generator, Arc::clone(&cache), Arc::clone(&diagnostics));
        tracing::info!(devices = devices.len(), jit = jit.has_generator(), "runtime initialized");

        Ok(Self {
            config,
            platforms,
            devices,
            device_handles,
            host,
            buffers: RwLock::new(HandleTable::new()),
            events: RwLock::new(HandleTable::new()),
            cache,
            diagnostics,
            jit,
        })
    }

    /// Process-wide runtime, configured from the environment on first use.
    pub fn global() -> Result<&'static Runtime> {
        if let Some(runtime) = GLOBAL.get() {
            return Ok(runtime);
        }
        let runtime = Runtime::new(RuntimeConfig::from_env())?;
        // A racing initializer may win; its instance is used and ours dropped.
        Ok(GLOBAL.get_or_init(|| runtime))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CompilationCache> {
        &self.cache
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn jit(&self) -> &JitManager {
        &self.jit
    }

    pub fn platforms(&self) -> impl Iterator<Item = &dyn Platform> {
        self.platforms.iter().map(|platform| &**platform)
    }

    /// Publish any error of `result` before returning it.
    fn report<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.diagnostics.error(format!("{operation}: {err}"));
        }
        result
    }

    // ------------------------------------------------------------------ runtime

    pub fn version() -> Version {
        VERSION
    }

    pub fn features(&self) -> Features {
        Features {
            has_jit: self.jit.has_generator(),
            supported_languages: self.jit.languages(),
            ..Default::default()
        }
    }

    /// Apply runtime-wide options; `global_cache_dir: None` restores the
    /// default cache directory.
    pub fn set_options(&self, options: &Options) -> Result<()> {
        self.report("set_options", expect(Some(options)).map(|_| ()))?;
        self.cache.set_directory(options.global_cache_dir.clone());
        Ok(())
    }

    // ------------------------------------------------------------------ devices

    pub fn count_devices(&self) -> usize {
        self.platforms.iter().map(|platform| platform.device_count()).sum()
    }

    /// Descriptions of up to `max_count` devices, platform by platform.
    pub fn list_devices(&self, max_count: usize) -> Result<Vec<DeviceInfo>> {
        let mut infos = Vec::with_capacity(max_count.min(self.count_devices()));
        for platform in &self.platforms {
            let remaining = max_count - infos.len();
            if remaining == 0 {
                break;
            }
            let appended = platform.append_device_infos(Some(&mut infos), remaining);
            self.report("list_devices", appended)?;
        }
        Ok(infos)
    }

    pub fn get_device(&self, request: &GetDeviceRequest) -> Result<DeviceHandle> {
        let result = (|| -> Result<DeviceHandle> {
            expect(Some(request))?;
            let platform = self
                .platforms
                .iter()
                .find(|platform| platform.device_type() == request.device_type)
                .ok_or_else(|| RuntimeError::invalid_value(format!("no {} platform", request.device_type)))?;
            let device = platform.get_device(request)?;
            self.device_handles
                .get(&device.id())
                .copied()
                .ok_or(RuntimeError::InvalidHandle(0))
        })();
        self.report("get_device", result)
    }

    /// Device behind `handle`; null is the host.
    fn device(&self, handle: DeviceHandle) -> Result<&Arc<dyn Device>> {
        let handle = if handle.is_null() { self.host } else { handle };
        self.devices.get(handle)
    }

    pub fn get_device_handle(&self, device: DeviceHandle) -> Result<DeviceHandleInfo> {
        let handle = self.report("get_device_handle", self.device(device))?.native_handle();
        Ok(DeviceHandleInfo {
            handle,
            ..Default::default()
        })
    }

    pub fn get_device_info(&self, device: DeviceHandle) -> Result<DeviceInfo> {
        Ok(self.report("get_device_info", self.device(device))?.info())
    }

    pub fn get_device_features(&self, device: DeviceHandle, features: &mut DeviceFeatures) -> Result<()> {
        let result = self.device(device).and_then(|device| device.features(features));
        self.report("get_device_features", result)
    }

    pub fn set_device_options(&self, device: DeviceHandle, options: &DeviceOptions) -> Result<()> {
        let result = self.device(device).and_then(|device| device.set_options(options));
        self.report("set_device_options", result)
    }

    /// Wait for the device. The null handle returns immediately.
    pub fn synchronize_device(&self, device: DeviceHandle) -> Result<()> {
        if device.is_null() {
            return Ok(());
        }
        let result = self.device(device).and_then(|device| device.sync());
        self.report("synchronize_device", result)
    }

    pub fn launch_kernel(&self, device: DeviceHandle, info: &LaunchKernelInfo) -> Result<()> {
        let result = self.device(device).and_then(|device| {
            expect(Some(info))?;
            let _span = perf_span!("launch_kernel", kernel = info.kernel_name.as_str());
            device.launch_kernel(info)
        });
        self.report("launch_kernel", result)
    }

    // ------------------------------------------------------------------ buffers

    pub fn create_buffer(&self, device: DeviceHandle, info: &CreateBufferInfo) -> Result<BufferHandle> {
        let result = (|| -> Result<BufferHandle> {
            expect(Some(info))?;
            let device = Arc::clone(self.device(device)?);
            let buffer = device.create_buffer(info)?;
            let handle = self.buffers.write().insert(BufferEntry { buffer, device });
            tracing::trace!(buffer = %handle, size = info.size, "buffer created");
            Ok(handle)
        })();
        self.report("create_buffer", result)
    }

    fn buffer(&self, handle: BufferHandle) -> Result<(Arc<dyn Buffer>, Arc<dyn Device>)> {
        let buffers = self.buffers.read();
        let entry = buffers.get(handle)?;
        Ok((Arc::clone(&entry.buffer), Arc::clone(&entry.device)))
    }

    pub fn destroy_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let result = self.buffers.write().remove(buffer).map(drop);
        self.report("destroy_buffer", result)
    }

    pub fn get_buffer_pointer(&self, buffer: BufferHandle) -> Result<GetBufferPointerInfo> {
        let result = self.buffer(buffer).and_then(|(buffer, _)| buffer.pointer());
        self.report("get_buffer_pointer", result)
    }

    /// Size of a buffer in bytes.
    pub fn buffer_size(&self, buffer: BufferHandle) -> Result<usize> {
        let result = self.buffer(buffer).map(|(buffer, _)| buffer.size());
        self.report("buffer_size", result)
    }

    /// Copy `regions` from `src` into `dst`, routed by the owning devices.
    pub fn copy_buffer(&self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopy]) -> Result<()> {
        let result = (|| -> Result<()> {
            let (src_buffer, src_device) = self.buffer(src)?;
            let (dst_buffer, dst_device) = self.buffer(dst)?;
            copy_between(
                src_buffer.as_ref(),
                src_device.id(),
                dst_buffer.as_ref(),
                dst_device.id(),
                regions,
            )
        })();
        self.report("copy_buffer", result)
    }

    /// Write `word` `count` times starting at byte `offset`.
    pub fn fill_buffer(&self, buffer: BufferHandle, offset: usize, count: usize, word: u32) -> Result<()> {
        let result = self.buffer(buffer).and_then(|(buffer, _)| buffer.fill(offset, count, word));
        self.report("fill_buffer", result)
    }

    pub fn copy_buffer_from_host(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let result = self.buffer(buffer).and_then(|(buffer, _)| buffer.copy_from_host(offset, data));
        self.report("copy_buffer_from_host", result)
    }

    pub fn copy_buffer_to_host(&self, buffer: BufferHandle, offset: usize, data: &mut [u8]) -> Result<()> {
        let result = self.buffer(buffer).and_then(|(buffer, _)| buffer.copy_to_host(offset, data));
        self.report("copy_buffer_to_host", result)
    }

    /// Typed [`Runtime::copy_buffer_from_host`].
    pub fn write_buffer<T: Pod>(&self, buffer: BufferHandle, offset: usize, data: &[T]) -> Result<()> {
        self.copy_buffer_from_host(buffer, offset, bytemuck::cast_slice(data))
    }

    /// Typed [`Runtime::copy_buffer_to_host`].
    pub fn read_buffer<T: Pod>(&self, buffer: BufferHandle, offset: usize, data: &mut [T]) -> Result<()> {
        self.copy_buffer_to_host(buffer, offset, bytemuck::cast_slice_mut(data))
    }

    /// Wait for the device owning `buffer`.
    pub fn synchronize_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let result = self
            .buffer(buffer)
            .and_then(|(buffer, device)| buffer.sync().and_then(|_| device.sync()));
        self.report("synchronize_buffer", result)
    }

    // ------------------------------------------------------------------ raw memory

    pub fn allocate_memory(&self, device: DeviceHandle, size: usize) -> Result<*mut c_void> {
        let result = (|| -> Result<*mut c_void> {
            if size == 0 {
                return Err(RuntimeError::invalid_value("cannot allocate 0 bytes"));
            }
            self.device(device)?.allocate_memory(size)
        })();
        self.report("allocate_memory", result)
    }

    pub fn release_memory(&self, device: DeviceHandle, ptr: *mut c_void) -> Result<()> {
        let result = (|| -> Result<()> {
            if ptr.is_null() {
                return Err(RuntimeError::invalid_pointer("cannot release a null pointer"));
            }
            self.device(device)?.release_memory(ptr)
        })();
        self.report("release_memory", result)
    }

    // ------------------------------------------------------------------ events

    pub fn create_event(&self, device: DeviceHandle, info: &CreateEventInfo) -> Result<EventHandle> {
        let result = (|| -> Result<EventHandle> {
            expect(Some(info))?;
            let device = self.device(device)?;
            let event = device.create_event(info)?;
            Ok(self.events.write().insert(EventEntry {
                event,
                device: device.id(),
            }))
        })();
        self.report("create_event", result)
    }

    fn event(&self, handle: EventHandle) -> Result<(Arc<dyn Event>, DeviceId)> {
        let events = self.events.read();
        let entry = events.get(handle)?;
        Ok((Arc::clone(&entry.event), entry.device))
    }

    pub fn destroy_event(&self, event: EventHandle) -> Result<()> {
        let result = self.events.write().remove(event).map(drop);
        self.report("destroy_event", result)
    }

    pub fn record_event(&self, event: EventHandle) -> Result<()> {
        let result = self.event(event).and_then(|(event, _)| event.record());
        self.report("record_event", result)
    }

    /// Query completion of `start` (and `end` unless null).
    ///
    /// Passing `info` requests the elapsed time `end - start`, which needs a
    /// non-null `end` on the same device.
    pub fn query_event(
        &self,
        start: EventHandle,
        end: EventHandle,
        mut info: Option<&mut QueryEventInfo>,
    ) -> Result<EventStatus> {
        let result = (|| -> Result<EventStatus> {
            let (start_event, start_device) = self.event(start)?;
            if let Some(info) = info.as_deref_mut() {
                expect_mut(Some(info))?;
                if end.is_null() {
                    return Err(RuntimeError::InvalidHandle(end.raw()));
                }
            }
            let end = if end.is_null() { None } else { Some(self.event(end)?) };
            if let Some((_, end_device)) = &end {
                if *end_device != start_device {
                    return Err(RuntimeError::device_mismatch(start_device, end_device));
                }
            }

            let status = start_event.query(end.as_ref().map(|(event, _)| event.as_ref()), info.is_some())?;
            if let (Some(info), EventStatus::Complete { elapsed_ms: Some(ms) }) = (info.as_deref_mut(), status) {
                info.elapsed_time_ms = ms;
            }
            Ok(status)
        })();
        self.report("query_event", result)
    }

    pub fn synchronize_event(&self, event: EventHandle) -> Result<()> {
        let result = self.event(event).and_then(|(event, _)| event.sync());
        self.report("synchronize_event", result)
    }

    // ------------------------------------------------------------------ JIT

    pub fn compile_jit(
        &self,
        program: &str,
        options: &JitCompileOptions,
        result: Option<&mut JitCompileResult>,
    ) -> Result<ModuleHandle> {
        self.report("compile_jit", self.jit.compile(program, options, result))
    }

    pub fn lookup_jit(&self, module: ModuleHandle, function: &str, info: &mut JitLookupInfo) -> Result<()> {
        let result = (|| -> Result<()> {
            expect_mut(Some(&mut *info))?;
            info.function = self.jit.lookup(module, function)?;
            Ok(())
        })();
        self.report("lookup_jit", result)
    }

    pub fn link_jit(&self, module: ModuleHandle, libraries: &[JitLinkInfo]) -> Result<()> {
        self.report("link_jit", self.jit.link(module, libraries))
    }

    pub fn destroy_jit_module(&self, module: ModuleHandle) -> Result<()> {
        self.report("destroy_jit_module", self.jit.destroy(module))
    }

    pub fn free_jit_compile_result(&self, result: &mut JitCompileResult) -> Result<()> {
        let outcome = self.jit.free_compile_result(result);
        self.report("free_jit_compile_result", outcome)
    }

    // ------------------------------------------------------------------ diagnostics

    pub fn register_log_callback(&self, info: &LogReportCallbackCreateInfo) -> Result<LogCallbackHandle> {
        self.report("register_log_callback", self.diagnostics.register(info))
    }

    pub fn unregister_log_callback(&self, handle: LogCallbackHandle) -> Result<()> {
        self.report("unregister_log_callback", self.diagnostics.unregister(handle))
    }

    pub fn log_report_message(&self, levels: LogLevel, message: &str) -> Result<()> {
        self.report("log_report_message", self.diagnostics.publish(levels, message))
    }

    /// Handle of device `number` of `device_type`.
    pub fn device_handle(&self, device_type: DeviceType, number: u32) -> Result<DeviceHandle> {
        self.get_device(&GetDeviceRequest::new(device_type, number))
    }
}

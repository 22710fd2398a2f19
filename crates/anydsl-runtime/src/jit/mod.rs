//! JIT module manager
//!
//! ```text
//! compile ──▶ module name jit_<hash(program)>
//!    │
//!    ├─ cache hit [target tag + program] ──────────────┐
//!    │     └─ device code [ext + program] ─▶ overlay   │
//!    │                                                 ▼
//!    └─ miss ──▶ CodeGenerator::generate ──▶ store ──▶ load ──▶ ModuleHandle
//!                    └─ device code ─▶ store + overlay (<module><ext>)
//! ```
//!
//! Device code lands in the file overlay of the compilation cache under
//! `<module name><ext>`, which is the file name a host image passes to
//! kernel launches.

pub mod codegen;
pub mod image;

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anydsl_tracing::performance::record_compile;
use parking_lot::{Mutex, RwLock};

pub use codegen::{
    CodeGenerator, CodeImage, CodegenFailure, CodegenRequest, CommandCodegen, GeneratedCode, DEVICE_CODE_EXTENSIONS,
};
pub use image::{link_library, linked_libraries, LibraryImage};

use crate::cache::{default_key_hash, CompilationCache};
use crate::chain::{expect, expect_mut};
use crate::error::{Result, RuntimeError};
use crate::handle::{HandleTable, ModuleHandle};
use crate::log::Diagnostics;
use crate::types::{CompileLanguages, JitCompileOptions, JitCompileResult, JitLinkInfo};

/// Highest accepted `opt_level`
pub const MAX_OPT_LEVEL: u32 = 3;
/// Highest accepted `log_level`
pub const MAX_LOG_LEVEL: u32 = 4;

struct JitModule {
    name: String,
    image: Box<dyn CodeImage>,
}

/// Points the cache at a per-call directory and restores the previous
/// user directory when dropped.
struct CacheDirOverride<'a> {
    cache: &'a CompilationCache,
    previous: Option<PathBuf>,
    active: bool,
}

impl<'a> CacheDirOverride<'a> {
    fn apply(cache: &'a CompilationCache, directory: Option<&Path>) -> Self {
        let previous = cache.user_directory();
        if let Some(directory) = directory {
            cache.set_directory(Some(directory.to_path_buf()));
        }
        Self {
            cache,
            previous,
            active: directory.is_some(),
        }
    }
}

impl Drop for CacheDirOverride<'_> {
    fn drop(&mut self) {
        if self.active {
            self.cache.set_directory(self.previous.take());
        }
    }
}

pub struct JitManager {
    generator: Option<Arc<dyn CodeGenerator>>,
    cache: Arc<CompilationCache>,
    diagnostics: Arc<Diagnostics>,
    modules: RwLock<HandleTable<ModuleHandle, JitModule>>,
    /// Serializes the code generator.
    compile_lock: Mutex<()>,
}

impl JitManager {
    pub fn new(
        generator: Option<Arc<dyn CodeGenerator>>,
        cache: Arc<CompilationCache>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            generator,
            cache,
            diagnostics,
            modules: RwLock::new(HandleTable::new()),
            compile_lock: Mutex::new(()),
        }
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Languages the configured generator accepts.
    pub fn languages(&self) -> CompileLanguages {
        self.generator
            .as_ref()
            .map(|generator| generator.languages())
            .unwrap_or_else(CompileLanguages::empty)
    }

    fn generator(&self) -> Result<&Arc<dyn CodeGenerator>> {
        self.generator
            .as_ref()
            .ok_or_else(|| RuntimeError::not_supported("no JIT code generator configured"))
    }

    /// Name a program's module gets.
    pub fn module_name(program: &str) -> String {
        format!("jit_{:x}", default_key_hash(program.as_bytes()))
    }

    /// Compile `program` into a new module.
    ///
    /// The generator log is written to `result` on success and on failure.
    pub fn compile(
        &self,
        program: &str,
        options: &JitCompileOptions,
        mut result: Option<&mut JitCompileResult>,
    ) -> Result<ModuleHandle> {
        expect(Some(options))?;
        if let Some(result) = result.as_deref_mut() {
            expect_mut(Some(result))?;
        }
        if program.is_empty() {
            return Err(RuntimeError::invalid_value("JIT program is empty"));
        }
        if options.opt_level > MAX_OPT_LEVEL {
            return Err(RuntimeError::invalid_value(format!("opt_level {} > {MAX_OPT_LEVEL}", options.opt_level)));
        }
        if options.log_level > MAX_LOG_LEVEL {
            return Err(RuntimeError::invalid_value(format!("log_level {} > {MAX_LOG_LEVEL}", options.log_level)));
        }
        let generator = self.generator()?;
        if !generator.languages().intersects(options.language) {
            return Err(RuntimeError::not_supported(format!("{:?}", options.language)));
        }

        let _serial = self.compile_lock.lock();
        let _directory = CacheDirOverride::apply(&self.cache, options.cache_dir.as_deref());

        let start = Instant::now();
        let module_name = Self::module_name(program);
        let ext = generator.image_extension();
        let mut key = generator.target_tag().into_bytes();
        key.extend_from_slice(program.as_bytes());

        let cached = if options.use_cache {
            self.cache.load_from_cache(&key, ext)
        } else {
            None
        };

        let (host_image, cache_hit, log) = match cached {
            Some(host_image) => {
                for ext in DEVICE_CODE_EXTENSIONS {
                    if let Some(code) = self.cache.load_from_cache(&device_code_key(ext, program), ext) {
                        self.cache.register_file(format!("{module_name}{ext}"), code);
                    }
                }
                (host_image, true, String::new())
            }
            None => {
                let request = CodegenRequest {
                    module_name: &module_name,
                    program,
                    opt_level: options.opt_level,
                    log_level: options.log_level,
                    language: options.language,
                };
                let generated = match generator.generate(&request) {
                    Ok(generated) => generated,
                    Err(failure) => {
                        if let Some(result) = result.as_deref_mut() {
                            result.log_output = failure.log;
                        }
                        self.diagnostics
                            .error(format!("JIT: error while compiling sources: {}", failure.message));
                        return Err(RuntimeError::jit(failure.message));
                    }
                };

                if options.use_cache {
                    self.store(&key, &generated.host_image, ext);
                }
                for (ext, code) in generated.device_code {
                    if options.use_cache {
                        self.store(&device_code_key(&ext, program), &code, &ext);
                    }
                    self.cache.register_file(format!("{module_name}{ext}"), code);
                }
                (generated.host_image, false, generated.log)
            }
        };
        record_compile(&module_name, cache_hit, start.elapsed().as_micros() as u64);

        let image = generator.load(&module_name, &host_image)?;
        let handle = self.modules.write().insert(JitModule {
            name: module_name.clone(),
            image,
        });
        tracing::info!(module = %module_name, handle = %handle, cache_hit, "JIT module ready");

        if let Some(result) = result {
            result.module = handle;
            result.log_output = log;
        }
        Ok(handle)
    }

    fn store(&self, key: &[u8], payload: &[u8], ext: &str) {
        if let Err(err) = self.cache.store_to_cache(key, payload, ext) {
            self.diagnostics.warn(format!("JIT: cannot cache '{ext}' output: {err}"));
        }
    }

    /// Address of `function` in `module`.
    pub fn lookup(&self, module: ModuleHandle, function: &str) -> Result<*const c_void> {
        self.generator()?;
        let modules = self.modules.read();
        let module = modules.get(module)?;
        module
            .image
            .symbol(function)
            .ok_or_else(|| RuntimeError::JitNoFunction(format!("'{function}' in {}", module.name)))
    }

    /// Make `libraries` visible to every JIT module. A null `module` means
    /// all modules; the link is process-global either way.
    pub fn link(&self, module: ModuleHandle, libraries: &[JitLinkInfo]) -> Result<()> {
        self.generator()?;
        if libraries.is_empty() {
            return Err(RuntimeError::invalid_value("no libraries to link"));
        }
        if !module.is_null() {
            self.modules.read().get(module)?;
        }

        for info in libraries {
            expect(Some(info))?;
            link_library(&info.library_filename).map_err(|err| {
                RuntimeError::jit(format!("cannot link '{}': {err}", info.library_filename.display()))
            })?;
        }
        Ok(())
    }

    /// Release a module. Later lookups fail with `InvalidHandle`.
    pub fn destroy(&self, module: ModuleHandle) -> Result<()> {
        self.generator()?;
        let removed = self.modules.write().remove(module)?;
        tracing::debug!(module = %removed.name, "JIT module destroyed");
        Ok(())
    }

    /// Release the log held by `result`.
    pub fn free_compile_result(&self, result: &mut JitCompileResult) -> Result<()> {
        expect_mut(Some(result))?;
        result.log_output = String::new();
        Ok(())
    }

    /// Number of live modules
    pub fn module_count(&self) -> usize {
        self.modules.read().len()
    }
}

fn device_code_key(ext: &str, program: &str) -> Vec<u8> {
    let mut key = ext.as_bytes().to_vec();
    key.extend_from_slice(program.as_bytes());
    key
}

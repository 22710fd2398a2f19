//! Kernel loading for accelerator devices
//!
//! A kernel launch names a source file and a function. [`KernelCache`]
//! resolves that pair to a loaded device function:
//!
//! ```text
//! file name ──▶ module cache (canonical path) ──hit──────────────┐
//!                   │ miss                                       │
//!                   ▼                                            ▼
//!            source (overlay or disk)                     function cache
//!                   │                                            │ miss
//!                   ▼                                            ▼
//!     compilation cache [target tag + source] ──miss──▶ compiler │
//!                   │                                            │
//!                   ▼                                            ▼
//!               loader.load_module ──────────────────▶ loader.get_function
//! ```
//!
//! One cache exists per device and every lookup holds its lock, so the
//! compiler is never run twice for the same module on one device.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anydsl_tracing::performance::record_compile;
use parking_lot::Mutex;

use crate::cache::CompilationCache;
use crate::error::{Result, RuntimeError};
use crate::log::Diagnostics;

/// Turns kernel source into a loadable image.
pub trait KernelCompiler: Send + Sync {
    /// Identifies the compilation target, e.g. a compute capability. Part of
    /// the cache key.
    fn target_tag(&self) -> String;

    /// Source file extensions this compiler accepts, with the leading dot.
    fn source_extensions(&self) -> &[&str];

    /// Extension of cached images, with the leading dot.
    fn image_extension(&self) -> &str;

    fn compile(&self, path: &Path, source: &[u8]) -> Result<Vec<u8>>;
}

/// Loads images and resolves functions on one device.
pub trait ModuleLoader: Send + Sync {
    type Module: Send;
    type Function: Copy + Send;

    /// Backend name used in error messages
    fn backend(&self) -> &'static str;

    fn load_module(&self, name: &Path, image: &[u8]) -> Result<Self::Module>;

    /// `Ok(None)` when the module has no function called `name`.
    fn get_function(&self, module: &Self::Module, name: &str) -> Result<Option<Self::Function>>;
}

struct LoadedModule<L: ModuleLoader> {
    module: L::Module,
    functions: HashMap<String, L::Function>,
}

struct KernelState<L: ModuleLoader> {
    modules: HashMap<PathBuf, LoadedModule<L>>,
    dump_images: bool,
}

/// Per-device module and function cache.
pub struct KernelCache<C: KernelCompiler, L: ModuleLoader> {
    compiler: C,
    loader: L,
    cache: Arc<CompilationCache>,
    diagnostics: Arc<Diagnostics>,
    state: Mutex<KernelState<L>>,
}

impl<C: KernelCompiler, L: ModuleLoader> KernelCache<C, L> {
    pub fn new(compiler: C, loader: L, cache: Arc<CompilationCache>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            compiler,
            loader,
            cache,
            diagnostics,
            state: Mutex::new(KernelState {
                modules: HashMap::new(),
                dump_images: false,
            }),
        }
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Also write freshly compiled images next to their source as
    /// `<file>.<target tag><image ext>`.
    pub fn set_dump_images(&self, dump: bool) {
        self.state.lock().dump_images = dump;
    }

    /// Number of loaded modules
    pub fn module_count(&self) -> usize {
        self.state.lock().modules.len()
    }

    /// Resolve `function` in the kernel file `file`, compiling and loading
    /// the module on first use.
    pub fn function(&self, file: &Path, function: &str) -> Result<L::Function> {
        let mut state = self.state.lock();
        let canonical = weakly_canonical(file);

        if !state.modules.contains_key(&canonical) {
            let module = self.load(file, &canonical, state.dump_images)?;
            state.modules.insert(
                canonical.clone(),
                LoadedModule {
                    module,
                    functions: HashMap::new(),
                },
            );
        }

        let loaded = state
            .modules
            .get_mut(&canonical)
            .ok_or_else(|| RuntimeError::platform(self.loader.backend(), "module vanished from cache"))?;

        if let Some(found) = loaded.functions.get(function) {
            return Ok(*found);
        }

        match self.loader.get_function(&loaded.module, function)? {
            Some(found) => {
                tracing::debug!(function, file = %file.display(), "resolved kernel function");
                loaded.functions.insert(function.to_string(), found);
                Ok(found)
            }
            None => {
                self.diagnostics.info(format!(
                    "Function '{function}' is not present in '{}'",
                    file.display()
                ));
                Err(RuntimeError::platform(
                    self.loader.backend(),
                    format!("function '{function}' not found in '{}'", file.display()),
                ))
            }
        }
    }

    fn load(&self, file: &Path, canonical: &Path, dump_images: bool) -> Result<L::Module> {
        let extension = canonical
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        if !self.compiler.source_extensions().contains(&extension.as_str()) {
            let message = format!(
                "Incorrect extension for kernel file '{}' (should be one of {:?})",
                canonical.display(),
                self.compiler.source_extensions()
            );
            self.diagnostics.error(&message);
            return Err(RuntimeError::invalid_value(message));
        }

        // The overlay is keyed by the name the producer registered, so try
        // the caller's spelling before the canonical one.
        let source = if self.cache.is_registered(file) {
            self.cache.load_file(file)?
        } else {
            self.cache.load_file(canonical)?
        };

        let start = Instant::now();
        let tag = self.compiler.target_tag();
        let mut key = tag.clone().into_bytes();
        key.extend_from_slice(&source);

        let ext = self.compiler.image_extension();
        let (image, cache_hit) = match self.cache.load_from_cache(&key, ext) {
            Some(image) => (image, true),
            None => {
                let image = self.compiler.compile(canonical, &source)?;
                if let Err(err) = self.cache.store_to_cache(&key, &image, ext) {
                    self.diagnostics
                        .warn(format!("Failed to store '{}' in the cache: {err}", canonical.display()));
                }
                if dump_images {
                    let dump = PathBuf::from(format!("{}.{tag}{ext}", canonical.display()));
                    self.cache.store_file(&dump, &image)?;
                }
                (image, false)
            }
        };
        record_compile(&canonical.to_string_lossy(), cache_hit, start.elapsed().as_micros() as u64);

        self.loader.load_module(canonical, &image)
    }
}

/// Canonical form of `path` that does not require the file to exist: the
/// longest existing prefix is canonicalized and the rest appended.
pub fn weakly_canonical(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }

    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut existing = PathBuf::new();
    let mut rest = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir if rest.as_os_str().is_empty() => {
                existing.pop();
            }
            Component::ParentDir => {
                rest.pop();
            }
            other if rest.as_os_str().is_empty() && existing.join(other).exists() => existing.push(other),
            other => rest.push(other),
        }
    }

    fs::canonicalize(&existing).unwrap_or(existing).join(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingCompiler {
        calls: Arc<AtomicUsize>,
    }

    impl KernelCompiler for CountingCompiler {
        fn target_tag(&self) -> String {
            "test_target".to_string()
        }

        fn source_extensions(&self) -> &[&str] {
            &[".src"]
        }

        fn image_extension(&self) -> &str {
            ".img"
        }

        fn compile(&self, _path: &Path, source: &[u8]) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(source.to_ascii_uppercase())
        }
    }

    /// Modules are the image text; functions are its whitespace-separated words.
    struct WordLoader;

    impl ModuleLoader for WordLoader {
        type Module = String;
        type Function = usize;

        fn backend(&self) -> &'static str {
            "test"
        }

        fn load_module(&self, _name: &Path, image: &[u8]) -> Result<String> {
            Ok(String::from_utf8_lossy(image).into_owned())
        }

        fn get_function(&self, module: &String, name: &str) -> Result<Option<usize>> {
            Ok(module.split_whitespace().position(|word| word == name))
        }
    }

    fn kernel_cache(dir: &TempDir, calls: &Arc<AtomicUsize>) -> KernelCache<CountingCompiler, WordLoader> {
        KernelCache::new(
            CountingCompiler { calls: Arc::clone(calls) },
            WordLoader,
            Arc::new(CompilationCache::new(Some(dir.path().join("cache")))),
            Arc::new(Diagnostics::new()),
        )
    }

    #[test]
    fn test_compiles_once_per_module() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let kernels = kernel_cache(&dir, &calls);
        let file = dir.path().join("kernels.src");
        fs::write(&file, "alpha beta").unwrap();

        assert_eq!(kernels.function(&file, "BETA").unwrap(), 1);
        assert_eq!(kernels.function(&file, "ALPHA").unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(kernels.module_count(), 1);
    }

    #[test]
    fn test_image_reused_across_devices() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let file = dir.path().join("kernels.src");
        fs::write(&file, "gamma").unwrap();

        kernel_cache(&dir, &calls).function(&file, "GAMMA").unwrap();
        kernel_cache(&dir, &calls).function(&file, "GAMMA").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second device must hit the compilation cache");
    }

    #[test]
    fn test_missing_function() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let kernels = kernel_cache(&dir, &calls);
        let file = dir.path().join("kernels.src");
        fs::write(&file, "alpha").unwrap();

        let err = kernels.function(&file, "missing").unwrap_err();
        assert!(matches!(err, RuntimeError::Platform { backend: "test", .. }));
    }

    #[test]
    fn test_rejects_unknown_extension() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let kernels = kernel_cache(&dir, &calls);
        let file = dir.path().join("kernels.txt");
        fs::write(&file, "alpha").unwrap();

        assert!(matches!(kernels.function(&file, "ALPHA"), Err(RuntimeError::InvalidValue(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reads_registered_source() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let kernels = kernel_cache(&dir, &calls);
        kernels.cache.register_file("jit_module.src", b"delta".to_vec());

        assert_eq!(kernels.function(Path::new("jit_module.src"), "DELTA").unwrap(), 0);
    }

    #[test]
    fn test_dump_images() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let kernels = kernel_cache(&dir, &calls);
        kernels.set_dump_images(true);
        let file = dir.path().join("dumped.src");
        fs::write(&file, "epsilon").unwrap();

        kernels.function(&file, "EPSILON").unwrap();
        let dumped = weakly_canonical(&dir.path().join("dumped.src.test_target.img"));
        assert_eq!(fs::read(dumped).unwrap(), b"EPSILON");
    }

    #[test]
    fn test_weakly_canonical() {
        let dir = TempDir::new().unwrap();
        let base = fs::canonicalize(dir.path()).unwrap();

        let missing = dir.path().join("sub").join("..").join("file.cu");
        assert_eq!(weakly_canonical(&missing), base.join("file.cu"));

        let dotted = dir.path().join(".").join("a.cu");
        assert_eq!(weakly_canonical(&dotted), base.join("a.cu"));
    }
}

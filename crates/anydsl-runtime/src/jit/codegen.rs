//! Code generator boundary
//!
//! The runtime never parses source programs itself. A [`CodeGenerator`]
//! turns a program into a host image (plus optional device-code side
//! outputs) and loads images into executable [`CodeImage`]s.
//! [`CommandCodegen`] drives an external compiler executable.

use std::ffi::c_void;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::NamedTempFile;

use crate::error::{Result, RuntimeError};
use crate::types::CompileLanguages;

use super::image::LibraryImage;

/// Extensions of device-code side outputs, in lookup order.
pub const DEVICE_CODE_EXTENSIONS: [&str; 4] = [".cl", ".cu", ".nvvm", ".amdgpu"];

/// Input to one code generation run.
#[derive(Debug, Clone, Copy)]
pub struct CodegenRequest<'a> {
    pub module_name: &'a str,
    pub program: &'a str,
    pub opt_level: u32,
    pub log_level: u32,
    pub language: CompileLanguages,
}

/// Output of a successful run.
#[derive(Debug, Default, Clone)]
pub struct GeneratedCode {
    pub host_image: Vec<u8>,
    /// `(extension, code)` pairs; extensions come from [`DEVICE_CODE_EXTENSIONS`].
    pub device_code: Vec<(String, Vec<u8>)>,
    pub log: String,
}

/// Generation failed; `log` holds the compiler output.
#[derive(Debug, Clone)]
pub struct CodegenFailure {
    pub message: String,
    pub log: String,
}

impl CodegenFailure {
    pub fn new(message: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            log: log.into(),
        }
    }
}

/// Loaded executable code.
pub trait CodeImage: Send + Sync {
    /// Address of `name`, or `None` when the image does not define it.
    fn symbol(&self, name: &str) -> Option<*const c_void>;
}

pub trait CodeGenerator: Send + Sync {
    /// Identifies the host target. Part of the cache key.
    fn target_tag(&self) -> String;

    /// Extension used to cache host images, with the leading dot.
    fn image_extension(&self) -> &str;

    /// Languages [`CodeGenerator::generate`] accepts.
    fn languages(&self) -> CompileLanguages;

    fn generate(&self, request: &CodegenRequest<'_>) -> std::result::Result<GeneratedCode, CodegenFailure>;

    fn load(&self, module_name: &str, image: &[u8]) -> Result<Box<dyn CodeImage>>;
}

/// Runs an external compiler that emits a shared library.
///
/// Invocation, inside `work_dir`:
///
/// ```text
/// <compiler> <args..> -O<level> --log-level <n> -o <module>.<dll ext> <module>.<art|impala>
/// ```
///
/// Device-code side outputs are picked up as `<module><ext>` next to the
/// library when the compiler produced them.
#[derive(Debug, Clone)]
pub struct CommandCodegen {
    compiler: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl CommandCodegen {
    pub fn new(compiler: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            compiler: compiler.into(),
            args,
            work_dir: std::env::temp_dir().join("anydsl-jit"),
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn compiler(&self) -> &Path {
        &self.compiler
    }

    fn library_path(&self, module_name: &str) -> PathBuf {
        self.work_dir.join(format!(
            "{}{module_name}{}",
            std::env::consts::DLL_PREFIX,
            std::env::consts::DLL_SUFFIX
        ))
    }

    fn source_extension(language: CompileLanguages) -> &'static str {
        if language.contains(CompileLanguages::IMPALA) {
            ".impala"
        } else {
            ".art"
        }
    }
}

impl CodeGenerator for CommandCodegen {
    fn target_tag(&self) -> String {
        format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
    }

    fn image_extension(&self) -> &str {
        std::env::consts::DLL_SUFFIX
    }

    fn languages(&self) -> CompileLanguages {
        CompileLanguages::ARTIC | CompileLanguages::IMPALA
    }

    fn generate(&self, request: &CodegenRequest<'_>) -> std::result::Result<GeneratedCode, CodegenFailure> {
        let io_failure = |what: &str, err: std::io::Error| CodegenFailure::new(format!("{what}: {err}"), String::new());

        fs::create_dir_all(&self.work_dir).map_err(|err| io_failure("cannot create JIT work directory", err))?;
        let source = self
            .work_dir
            .join(format!("{}{}", request.module_name, Self::source_extension(request.language)));
        fs::write(&source, request.program).map_err(|err| io_failure("cannot write JIT source", err))?;
        let library = self.library_path(request.module_name);

        tracing::debug!(compiler = %self.compiler.display(), module = request.module_name, "running JIT compiler");
        let output = Command::new(&self.compiler)
            .args(&self.args)
            .arg(format!("-O{}", request.opt_level))
            .arg("--log-level")
            .arg(request.log_level.to_string())
            .arg("-o")
            .arg(&library)
            .arg(&source)
            .current_dir(&self.work_dir)
            .output()
            .map_err(|err| io_failure("cannot run JIT compiler", err))?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(CodegenFailure::new(
                format!("{} exited with {}", self.compiler.display(), output.status),
                log,
            ));
        }

        let host_image = fs::read(&library).map_err(|err| CodegenFailure::new(format!("no JIT output: {err}"), log.clone()))?;
        let device_code = DEVICE_CODE_EXTENSIONS
            .iter()
            .filter_map(|ext| {
                let path = self.work_dir.join(format!("{}{ext}", request.module_name));
                fs::read(path).ok().map(|code| (ext.to_string(), code))
            })
            .collect();

        Ok(GeneratedCode {
            host_image,
            device_code,
            log,
        })
    }

    fn load(&self, module_name: &str, image: &[u8]) -> Result<Box<dyn CodeImage>> {
        // A cache hit arrives without a library on disk.
        let library = self.library_path(module_name);
        if fs::read(&library).ok().as_deref() != Some(image) {
            install_library(&self.work_dir, &library, image)?;
        }
        let image = LibraryImage::open(&library)
            .map_err(|err| RuntimeError::jit(format!("cannot load '{}': {err}", library.display())))?;
        Ok(Box::new(image))
    }
}

/// Replace `library` with `image` by renaming a finished temp file over it.
///
/// A previously loaded module keeps its mapping of the old file.
fn install_library(work_dir: &Path, library: &Path, image: &[u8]) -> Result<()> {
    fs::create_dir_all(work_dir)?;
    let mut staged = NamedTempFile::new_in(work_dir)?;
    staged.write_all(image)?;
    staged.persist(library).map_err(|err| RuntimeError::Io(err.error))?;
    Ok(())
}

//! Shared-library images and process-global library linking

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use libloading::Library;
use parking_lot::Mutex;

use super::codegen::CodeImage;

/// Executable image backed by a dynamically loaded library.
pub struct LibraryImage {
    library: Library,
    path: PathBuf,
}

impl LibraryImage {
    pub fn open(path: &Path) -> std::result::Result<Self, libloading::Error> {
        // SAFETY: loading runs library initializers; JIT output has none
        // beyond what its compiler emits.
        let library = unsafe { Library::new(path) }?;
        tracing::debug!(library = %path.display(), "loaded JIT image");
        Ok(Self {
            library,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CodeImage for LibraryImage {
    fn symbol(&self, name: &str) -> Option<*const c_void> {
        // SAFETY: the symbol is only turned into an address, never called here.
        let symbol = unsafe { self.library.get::<unsafe extern "C" fn()>(name.as_bytes()) }.ok()?;
        Some(*symbol as *const c_void)
    }
}

/// Libraries linked into the process; never unloaded.
static LINKED: LazyLock<Mutex<Vec<(PathBuf, Library)>>> = LazyLock::new(|| Mutex::new(Vec::new()));

/// Load `path` so its symbols resolve for every image loaded afterwards.
/// Linking the same path twice is a no-op.
pub fn link_library(path: &Path) -> std::result::Result<(), libloading::Error> {
    let mut linked = LINKED.lock();
    if linked.iter().any(|(existing, _)| existing == path) {
        return Ok(());
    }

    let library = open_global(path)?;
    tracing::info!(library = %path.display(), "linked library into the JIT");
    linked.push((path.to_path_buf(), library));
    Ok(())
}

/// Paths of every library linked so far.
pub fn linked_libraries() -> Vec<PathBuf> {
    LINKED.lock().iter().map(|(path, _)| path.clone()).collect()
}

#[cfg(unix)]
fn open_global(path: &Path) -> std::result::Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};

    // SAFETY: see LibraryImage::open.
    unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL) }.map(Library::from)
}

#[cfg(not(unix))]
fn open_global(path: &Path) -> std::result::Result<Library, libloading::Error> {
    // SAFETY: see LibraryImage::open.
    unsafe { Library::new(path) }
}

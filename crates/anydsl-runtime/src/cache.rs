//! Content-addressed compilation cache
//!
//! Compiled artifacts (kernel images, JIT objects, device code) are stored as
//! files named after a hash of their key:
//!
//! ```text
//! <cache dir>/<hex(hash(key))><ext>
//!
//! ┌──────────────────────┬───────────────┬───────────────┐
//! │ key length (usize,   │   key bytes   │    payload    │
//! │ native endianness)   │               │               │
//! └──────────────────────┴───────────────┴───────────────┘
//! ```
//!
//! The key is embedded so that two keys hashing to the same file name can
//! never be confused: a load compares the stored key byte-for-byte and treats
//! any mismatch as a miss.
//!
//! The cache also keeps an in-memory file overlay. Files registered there
//! (for instance device code produced by the JIT) shadow the filesystem for
//! [`CompilationCache::load_file`].

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::mem::size_of;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Result, RuntimeError};

/// Hash function mapping a key to its file name.
pub type KeyHasher = fn(&[u8]) -> u64;

/// Default extension of cache entries
pub const DEFAULT_EXTENSION: &str = ".bin";

/// First 8 bytes of the key's BLAKE3 digest.
pub fn default_key_hash(key: &[u8]) -> u64 {
    let digest = blake3::hash(key);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// `<dir of the running executable>/cache`, or `./cache` when the
/// executable path is unknown.
pub fn default_directory() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_default()
        .join("cache")
}

#[derive(Default)]
struct CacheState {
    /// User-selected directory; `None` means [`default_directory`].
    directory: Option<PathBuf>,
    overlay: HashMap<PathBuf, Vec<u8>>,
}

/// Process-wide compilation cache. All operations take one lock.
pub struct CompilationCache {
    state: Mutex<CacheState>,
    hasher: KeyHasher,
}

impl Default for CompilationCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CompilationCache {
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self::with_hasher(directory, default_key_hash)
    }

    /// Cache using `hasher` for file names.
    pub fn with_hasher(directory: Option<PathBuf>, hasher: KeyHasher) -> Self {
        Self {
            state: Mutex::new(CacheState {
                directory,
                overlay: HashMap::new(),
            }),
            hasher,
        }
    }

    /// Directory entries are stored in.
    pub fn directory(&self) -> PathBuf {
        Self::resolve_directory(&self.state.lock())
    }

    /// Directory explicitly selected by the user, if any.
    pub fn user_directory(&self) -> Option<PathBuf> {
        self.state.lock().directory.clone()
    }

    /// Select the storage directory; `None` restores the default.
    pub fn set_directory(&self, directory: Option<PathBuf>) {
        tracing::debug!(directory = ?directory, "cache directory changed");
        self.state.lock().directory = directory;
    }

    fn resolve_directory(state: &CacheState) -> PathBuf {
        state.directory.clone().unwrap_or_else(default_directory)
    }

    fn name_for(&self, key: &[u8], ext: &str) -> String {
        format!("{:x}{}", (self.hasher)(key), ext)
    }

    /// File an entry for `key` is stored in.
    pub fn filename_for(&self, key: &[u8], ext: &str) -> PathBuf {
        self.directory().join(self.name_for(key, ext))
    }

    /// Make `contents` visible to [`CompilationCache::load_file`] under
    /// `name` without touching the filesystem.
    pub fn register_file(&self, name: impl Into<PathBuf>, contents: Vec<u8>) {
        let name = name.into();
        tracing::debug!(file = %name.display(), bytes = contents.len(), "registered in-memory file");
        self.state.lock().overlay.insert(name, contents);
    }

    /// Whether `name` is present in the in-memory overlay.
    pub fn is_registered(&self, name: &Path) -> bool {
        self.state.lock().overlay.contains_key(name)
    }

    /// Read a file, consulting the in-memory overlay first.
    pub fn load_file(&self, path: &Path) -> Result<Vec<u8>> {
        if let Some(contents) = self.state.lock().overlay.get(path) {
            return Ok(contents.clone());
        }

        fs::read(path).map_err(|err| {
            tracing::error!(file = %path.display(), error = %err, "can't open source file");
            RuntimeError::Io(err)
        })
    }

    /// Write `data` to `path`.
    pub fn store_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let _guard = self.state.lock();
        fs::write(path, data).map_err(|err| {
            tracing::error!(file = %path.display(), error = %err, "can't open destination file");
            RuntimeError::Io(err)
        })
    }

    /// Payload stored under `key`, or `None` on a miss.
    ///
    /// A missing file, a truncated header or an embedded key that differs
    /// from `key` are all misses.
    pub fn load_from_cache(&self, key: &[u8], ext: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let filename = Self::resolve_directory(&state).join(self.name_for(key, ext));

        let contents = match fs::read(&filename) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(file = %filename.display(), error = %err, "unreadable cache entry");
                return None;
            }
        };

        match split_entry(&contents, key) {
            Some(payload) => {
                tracing::debug!(file = %filename.display(), bytes = payload.len(), "loading from cache");
                Some(payload.to_vec())
            }
            None => {
                tracing::warn!(file = %filename.display(), "cache entry does not match its key");
                None
            }
        }
    }

    /// Store `payload` under `key`, creating the cache directory if needed.
    pub fn store_to_cache(&self, key: &[u8], payload: &[u8], ext: &str) -> Result<()> {
        let state = self.state.lock();
        let directory = Self::resolve_directory(&state);
        fs::create_dir_all(&directory)?;

        let filename = directory.join(self.name_for(key, ext));
        tracing::debug!(file = %filename.display(), bytes = payload.len(), "storing to cache");

        let mut entry = Vec::with_capacity(size_of::<usize>() + key.len() + payload.len());
        entry.extend_from_slice(&key.len().to_ne_bytes());
        entry.extend_from_slice(key);
        entry.extend_from_slice(payload);
        fs::write(&filename, entry)?;
        Ok(())
    }
}

/// Payload of an entry whose embedded key equals `key`.
fn split_entry<'a>(entry: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    let (len, rest) = entry.split_at_checked(size_of::<usize>())?;
    let len = usize::from_ne_bytes(len.try_into().ok()?);
    let (stored_key, payload) = rest.split_at_checked(len)?;
    (stored_key == key).then_some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache_in(dir: &TempDir) -> CompilationCache {
        CompilationCache::new(Some(dir.path().to_path_buf()))
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);

        cache.store_to_cache(b"sm_80kernel", b"image", ".cubin").unwrap();
        assert_eq!(cache.load_from_cache(b"sm_80kernel", ".cubin").as_deref(), Some(&b"image"[..]));
        assert_eq!(cache.load_from_cache(b"sm_80kernel", ".ptx"), None);
        assert_eq!(cache.load_from_cache(b"other", ".cubin"), None);
    }

    #[test]
    fn test_file_layout() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        cache.store_to_cache(b"key", b"payload", DEFAULT_EXTENSION).unwrap();

        let filename = cache.filename_for(b"key", DEFAULT_EXTENSION);
        assert!(filename.starts_with(dir.path()));
        assert!(filename.to_string_lossy().ends_with(".bin"));

        let raw = fs::read(&filename).unwrap();
        assert_eq!(&raw[..size_of::<usize>()], &3usize.to_ne_bytes());
        assert_eq!(&raw[size_of::<usize>()..], b"keypayload");
    }

    #[test]
    fn test_collision_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = CompilationCache::with_hasher(Some(dir.path().to_path_buf()), |_| 42);

        cache.store_to_cache(b"first", b"one", DEFAULT_EXTENSION).unwrap();
        assert_eq!(
            cache.filename_for(b"first", DEFAULT_EXTENSION),
            cache.filename_for(b"second", DEFAULT_EXTENSION)
        );
        assert_eq!(cache.load_from_cache(b"second", DEFAULT_EXTENSION), None);
        assert!(cache.load_from_cache(b"first", DEFAULT_EXTENSION).is_some());
    }

    #[test]
    fn test_truncated_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let filename = cache.filename_for(b"key", DEFAULT_EXTENSION);

        fs::write(&filename, [1u8, 2]).unwrap();
        assert_eq!(cache.load_from_cache(b"key", DEFAULT_EXTENSION), None);

        let mut header = 1000usize.to_ne_bytes().to_vec();
        header.extend_from_slice(b"key");
        fs::write(&filename, header).unwrap();
        assert_eq!(cache.load_from_cache(b"key", DEFAULT_EXTENSION), None);
    }

    #[test]
    fn test_empty_payload_is_a_hit() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        cache.store_to_cache(b"key", b"", DEFAULT_EXTENSION).unwrap();
        assert_eq!(cache.load_from_cache(b"key", DEFAULT_EXTENSION), Some(Vec::new()));
    }

    #[test]
    fn test_store_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let cache = CompilationCache::new(Some(nested.clone()));

        cache.store_to_cache(b"key", b"value", DEFAULT_EXTENSION).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_overlay_shadows_filesystem() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let path = dir.path().join("kernel.cu");

        cache.store_file(&path, b"on disk").unwrap();
        assert_eq!(cache.load_file(&path).unwrap(), b"on disk");

        cache.register_file(&path, b"in memory".to_vec());
        assert!(cache.is_registered(&path));
        assert_eq!(cache.load_file(&path).unwrap(), b"in memory");

        let err = cache.load_file(&dir.path().join("missing.cu")).unwrap_err();
        assert!(matches!(err, RuntimeError::Io(_)));
    }

    #[test]
    fn test_directory_override() {
        let dir = TempDir::new().unwrap();
        let cache = CompilationCache::default();
        assert_eq!(cache.user_directory(), None);
        assert!(cache.directory().ends_with("cache"));

        cache.set_directory(Some(dir.path().to_path_buf()));
        assert_eq!(cache.directory(), dir.path());
        cache.set_directory(None);
        assert_eq!(cache.directory(), default_directory());
    }

    #[test]
    fn test_default_hash_is_stable() {
        assert_eq!(default_key_hash(b"abc"), default_key_hash(b"abc"));
        assert_ne!(default_key_hash(b"abc"), default_key_hash(b"abd"));
    }
}

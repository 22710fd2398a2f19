//! Host system queries and aligned raw memory

use std::ffi::c_void;
use std::fs;
use std::ptr;

use crate::error::{Result, RuntimeError};

/// Alignment of raw host allocations (one cache line).
pub const ALIGNMENT: usize = 64;

const FALLBACK_NAME: &str = "Host";

#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
const MODEL_KEY: &str = "CPU part";
#[cfg(not(any(target_arch = "arm", target_arch = "aarch64")))]
const MODEL_KEY: &str = "model name";

/// Processor name, or `"Host"` when it cannot be determined.
pub fn cpu_name() -> String {
    match fs::read_to_string("/proc/cpuinfo") {
        Ok(text) => parse_model_name(&text, MODEL_KEY).unwrap_or_else(|| FALLBACK_NAME.to_string()),
        Err(err) => {
            tracing::debug!(error = %err, "failed to read /proc/cpuinfo");
            FALLBACK_NAME.to_string()
        }
    }
}

fn parse_model_name(cpuinfo: &str, key: &str) -> Option<String> {
    cpuinfo.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        (name.trim() == key).then(|| value.trim().to_string())
    })
}

/// Physical memory in bytes, 0 when unknown.
#[cfg(unix)]
pub fn total_memory() -> u64 {
    // SAFETY: sysconf only reads system configuration.
    let (pages, page_size) = unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGE_SIZE)) };
    if pages <= 0 || page_size <= 0 {
        return 0;
    }
    pages as u64 * page_size as u64
}

#[cfg(not(unix))]
pub fn total_memory() -> u64 {
    0
}

/// Allocate `size` bytes aligned to `alignment`.
#[cfg(unix)]
pub fn aligned_alloc(size: usize, alignment: usize) -> Result<*mut c_void> {
    if size == 0 {
        return Err(RuntimeError::invalid_value("cannot allocate 0 bytes"));
    }

    let mut ptr: *mut c_void = ptr::null_mut();
    // SAFETY: `ptr` is a valid out-pointer; posix_memalign validates the alignment.
    let ret = unsafe { libc::posix_memalign(&mut ptr, alignment, size) };
    match ret {
        0 if !ptr.is_null() => Ok(ptr),
        0 | libc::ENOMEM => Err(RuntimeError::OutOfHostMemory { requested: size }),
        libc::EINVAL => Err(RuntimeError::invalid_value(format!(
            "alignment {alignment} is not a power of two multiple of the pointer size"
        ))),
        _ => Err(RuntimeError::platform("host", format!("posix_memalign failed with error code {ret}"))),
    }
}

#[cfg(windows)]
pub fn aligned_alloc(size: usize, alignment: usize) -> Result<*mut c_void> {
    if size == 0 {
        return Err(RuntimeError::invalid_value("cannot allocate 0 bytes"));
    }
    // SAFETY: plain CRT allocation.
    let ptr = unsafe { libc::aligned_malloc(size, alignment) };
    if ptr.is_null() {
        return Err(RuntimeError::OutOfHostMemory { requested: size });
    }
    Ok(ptr)
}

/// Free memory returned by [`aligned_alloc`].
///
/// # Safety
///
/// `ptr` must come from [`aligned_alloc`] and must not be used afterwards.
#[cfg(unix)]
pub unsafe fn aligned_free(ptr: *mut c_void) {
    libc::free(ptr);
}

/// Free memory returned by [`aligned_alloc`].
///
/// # Safety
///
/// `ptr` must come from [`aligned_alloc`] and must not be used afterwards.
#[cfg(windows)]
pub unsafe fn aligned_free(ptr: *mut c_void) {
    libc::aligned_free(ptr);
}

/// Allocate `size` bytes aligned to `alignment`.
#[cfg(not(any(unix, windows)))]
pub fn aligned_alloc(size: usize, alignment: usize) -> Result<*mut c_void> {
    layout_alloc(size, alignment)
}

/// Free memory returned by [`aligned_alloc`].
///
/// # Safety
///
/// `ptr` must come from [`aligned_alloc`] and must not be used afterwards.
#[cfg(not(any(unix, windows)))]
pub unsafe fn aligned_free(ptr: *mut c_void) {
    layout_free(ptr)
}

/// Words stored in front of a [`layout_alloc`] block: total size, alignment.
#[cfg(any(test, not(any(unix, windows))))]
const HEADER_WORDS: usize = 2;

/// Allocator-backed aligned allocation for targets without a C aligned
/// allocator. The layout is recorded in front of the returned block.
#[cfg(any(test, not(any(unix, windows))))]
fn layout_alloc(size: usize, alignment: usize) -> Result<*mut c_void> {
    use std::alloc::{alloc, Layout};
    use std::mem::size_of;

    if size == 0 {
        return Err(RuntimeError::invalid_value("cannot allocate 0 bytes"));
    }
    if !alignment.is_power_of_two() {
        return Err(RuntimeError::invalid_value(format!("alignment {alignment} is not a power of two")));
    }
    let alignment = alignment.max(HEADER_WORDS * size_of::<usize>());
    let total = size
        .checked_add(alignment)
        .ok_or(RuntimeError::OutOfHostMemory { requested: size })?;
    let layout = Layout::from_size_align(total, alignment)
        .map_err(|err| RuntimeError::invalid_value(format!("bad layout for {size} bytes: {err}")))?;

    // SAFETY: the layout has a non-zero size.
    let base = unsafe { alloc(layout) };
    if base.is_null() {
        return Err(RuntimeError::OutOfHostMemory { requested: size });
    }
    // SAFETY: the block starts `alignment` bytes into the allocation, which
    // leaves room for the header words directly before it.
    unsafe {
        let block = base.add(alignment);
        let header = block.cast::<usize>().sub(HEADER_WORDS);
        header.write(total);
        header.add(1).write(alignment);
        Ok(block.cast::<c_void>())
    }
}

/// # Safety
///
/// `ptr` must come from [`layout_alloc`] and must not be used afterwards.
#[cfg(any(test, not(any(unix, windows))))]
unsafe fn layout_free(ptr: *mut c_void) {
    use std::alloc::{dealloc, Layout};

    let header = ptr.cast::<usize>().sub(HEADER_WORDS);
    let (total, alignment) = (header.read(), header.add(1).read());
    let base = ptr.cast::<u8>().sub(alignment);
    dealloc(base, Layout::from_size_align_unchecked(total, alignment));
}

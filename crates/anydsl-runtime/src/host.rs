//! Host-side helpers for generated code
//!
//! Small utilities layered on top of the core runtime: data-parallel loops,
//! joinable threads identified by small integers, monotonic clocks and
//! aligned raw memory.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ops::Range;
use std::sync::{Arc, LazyLock};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::backends::cpu::sysinfo;
use crate::error::{Result, RuntimeError};

pub use sysinfo::ALIGNMENT;

/// Run `body` over disjoint sub-ranges covering `range`.
///
/// `num_threads == 0` uses the global rayon pool; any other value runs on a
/// pool of exactly that size, created on first use and kept for later calls.
pub fn parallel_for<F>(num_threads: usize, range: Range<i32>, body: F) -> Result<()>
where
    F: Fn(Range<i32>) + Send + Sync,
{
    if range.is_empty() {
        return Ok(());
    }

    let chunks = match num_threads {
        0 => rayon::current_num_threads(),
        n => n,
    };
    let len = (range.end as i64 - range.start as i64) as usize;
    let chunk = len.div_ceil(chunks).max(1);
    let start = range.start;
    let end = range.end;

    let run = || {
        (0..len.div_ceil(chunk)).into_par_iter().for_each(|index| {
            let lower = start as i64 + (index * chunk) as i64;
            let upper = (lower + chunk as i64).min(end as i64);
            body(lower as i32..upper as i32);
        })
    };

    if num_threads == 0 {
        run();
    } else {
        sized_pool(num_threads)?.install(run);
    }
    Ok(())
}

static POOLS: LazyLock<Mutex<HashMap<usize, Arc<ThreadPool>>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

fn sized_pool(num_threads: usize) -> Result<Arc<ThreadPool>> {
    let mut pools = POOLS.lock();
    if let Some(pool) = pools.get(&num_threads) {
        return Ok(Arc::clone(pool));
    }
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|index| format!("anydsl-worker-{index}"))
        .build()
        .map_err(|err| RuntimeError::platform("host", format!("cannot build thread pool: {err}")))?;
    let pool = Arc::new(pool);
    pools.insert(num_threads, Arc::clone(&pool));
    Ok(pool)
}

#[derive(Default)]
struct Threads {
    running: HashMap<i32, JoinHandle<i32>>,
    free_ids: Vec<i32>,
    next_id: i32,
}

static THREADS: LazyLock<Mutex<Threads>> = LazyLock::new(|| Mutex::new(Threads::default()));

/// Start `body` on a new thread. Ids of joined threads are reused.
pub fn spawn_thread<F>(body: F) -> Result<i32>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    let mut threads = THREADS.lock();
    let id = match threads.free_ids.pop() {
        Some(id) => id,
        None => {
            let id = threads.next_id;
            threads.next_id += 1;
            id
        }
    };

    let handle = std::thread::Builder::new()
        .name(format!("anydsl-thread-{id}"))
        .spawn(body);
    match handle {
        Ok(handle) => {
            threads.running.insert(id, handle);
            Ok(id)
        }
        Err(err) => {
            threads.free_ids.push(id);
            Err(RuntimeError::platform("host", format!("cannot spawn thread: {err}")))
        }
    }
}

/// Join thread `id` and return its result.
pub fn sync_thread(id: i32) -> Result<i32> {
    // Joined outside the lock so other threads can spawn meanwhile.
    let handle = THREADS
        .lock()
        .running
        .remove(&id)
        .ok_or(RuntimeError::InvalidHandle(id as u64))?;
    let result = handle.join();
    THREADS.lock().free_ids.push(id);
    result.map_err(|_| RuntimeError::platform("host", format!("thread {id} panicked")))
}

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Monotonic microseconds since the first clock query in this process.
pub fn micro_time() -> u64 {
    EPOCH.elapsed().as_micros() as u64
}

/// Monotonic nanoseconds since the first clock query in this process.
pub fn nano_time() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Allocate `size` bytes aligned to [`ALIGNMENT`].
pub fn aligned_alloc(size: usize) -> Result<*mut c_void> {
    sysinfo::aligned_alloc(size, ALIGNMENT)
}

/// Free memory returned by [`aligned_alloc`].
///
/// # Safety
///
/// `ptr` must come from [`aligned_alloc`] and must not be used afterwards.
pub unsafe fn aligned_free(ptr: *mut c_void) {
    sysinfo::aligned_free(ptr)
}

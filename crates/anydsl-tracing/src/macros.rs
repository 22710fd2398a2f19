//! Instrumentation macros.

/// Timed span guard; fields are attached to an enclosing debug span.
///
/// ```rust
/// use anydsl_tracing::perf_span;
///
/// {
///     let _span = perf_span!("fill_buffer", bytes = 4096);
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = tracing::debug_span!("perf", name = $name, $($field = $value),+).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Debug-level event with an `event` field.
///
/// ```rust
/// use anydsl_tracing::perf_event;
///
/// perf_event!("cache_store", bytes = 128, hit = false);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        tracing::debug!(event = $name, $($field = $value),+);
    };
}

/// Evaluate a block and return `(result, duration_us)`.
///
/// ```rust
/// use anydsl_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<i32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        tracing::debug!(operation = $name, duration_us = duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_perf_span_with_fields() {
        let _span = perf_span!("launch", grid = 64, block = 32);
    }

    #[test]
    fn test_perf_event() {
        perf_event!("cache_hit", key_len = 12);
    }

    #[test]
    fn test_timed_block_returns_value() {
        let (value, duration_us) = timed_block!("sleep", {
            thread::sleep(Duration::from_millis(5));
            7
        });
        assert_eq!(value, 7);
        assert!(duration_us >= 5_000);
    }
}

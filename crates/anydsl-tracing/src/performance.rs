//! Timing helpers for runtime hot paths.
//!
//! ```rust
//! use anydsl_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("copy_buffer", Some(100));
//! // ... work ...
//! drop(span); // logged only when it took at least 100µs
//!
//! record_transfer(4096, "device_to_host", 12);
//! ```

use std::time::Instant;
use tracing::Level;

/// RAII guard that times a region and logs it on drop.
pub struct PerformanceSpan {
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Debug-level span; `threshold_us = None` always logs.
    pub fn new(span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, span_name, threshold_us)
    }

    pub fn with_level(level: Level, span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let span_name = span_name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %span_name),
            Level::DEBUG => tracing::debug_span!("perf", name = %span_name),
            Level::INFO => tracing::info_span!("perf", name = %span_name),
            Level::WARN => tracing::warn_span!("perf", name = %span_name),
            Level::ERROR => tracing::error_span!("perf", name = %span_name),
        };

        Self {
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.map_or(true, |threshold| elapsed_us >= threshold) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a buffer transfer. `route` names the copy path taken.
pub fn record_transfer(bytes: usize, route: &str, duration_us: u64) {
    let bandwidth_mb_s = if duration_us > 0 {
        bytes as f64 / duration_us as f64
    } else {
        0.0
    };

    tracing::debug!(
        event = "transfer",
        bytes,
        route,
        duration_us,
        bandwidth_mb_s,
        "buffer_transfer"
    );
}

/// Record a compilation (kernel module or JIT program).
pub fn record_compile(module: &str, cache_hit: bool, duration_us: u64) {
    tracing::debug!(event = "compile", module, cache_hit, duration_us, "compile_complete");
}

//! Diagnostics channel
//!
//! A level-filtered publish/subscribe hub. Runtime components publish
//! messages (driver errors, compiler logs, cache activity); callers subscribe
//! with a callback and a mask of levels they care about.
//!
//! Every message is also emitted as a `tracing` event at the matching level,
//! so a process with a subscriber installed sees the same stream without
//! registering a callback.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::chain::{expect, structure};
use crate::error::{Result, RuntimeError};
use crate::types::flag_set;

flag_set! {
    /// Severity levels of diagnostic messages
    pub struct LogLevel {
        const ERROR = 0x1;
        const WARNING = 0x2;
        const INFO = 0x4;
        const DEBUG = 0x8;
        const TRACE = 0x10;
    }
}

/// Receives `(levels, message)` for every delivered message.
#[derive(Clone)]
pub struct LogCallback(Arc<dyn Fn(LogLevel, &str) + Send + Sync>);

impl LogCallback {
    pub fn new(callback: impl Fn(LogLevel, &str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(callback))
    }

    fn call(&self, levels: LogLevel, message: &str) {
        (self.0)(levels, message)
    }
}

impl fmt::Debug for LogCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogCallback")
    }
}

structure! {
    /// Subscription request
    pub struct LogReportCallbackCreateInfo => LogReportCallbackCreateInfo {
        pub flags: LogLevel = LogLevel::empty(),
        pub callback: Option<LogCallback> = None,
    }
}

impl LogReportCallbackCreateInfo {
    pub fn new(flags: LogLevel, callback: impl Fn(LogLevel, &str) + Send + Sync + 'static) -> Self {
        Self {
            flags,
            callback: Some(LogCallback::new(callback)),
            ..Default::default()
        }
    }
}

/// Subscription handle: slot index + 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogCallbackHandle(u64);

impl LogCallbackHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

struct Handler {
    flags: LogLevel,
    callback: LogCallback,
}

/// Subscriber registry.
///
/// Unsubscribing disables a slot rather than removing it, so handles stay
/// valid indices for the lifetime of the hub.
#[derive(Default)]
pub struct Diagnostics {
    handlers: RwLock<Vec<Option<Handler>>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe. `InvalidValue` without a callback or with an empty mask.
    pub fn register(&self, info: &LogReportCallbackCreateInfo) -> Result<LogCallbackHandle> {
        expect(Some(info))?;
        let callback = info
            .callback
            .clone()
            .ok_or_else(|| RuntimeError::invalid_value("log callback is missing"))?;
        let flags = info.flags & LogLevel::all();
        if flags.is_empty() {
            return Err(RuntimeError::invalid_value("log callback needs at least one level"));
        }

        let mut handlers = self.handlers.write();
        handlers.push(Some(Handler { flags, callback }));
        Ok(LogCallbackHandle(handlers.len() as u64))
    }

    /// Disable a subscription. `InvalidHandle` for unknown handles.
    pub fn unregister(&self, handle: LogCallbackHandle) -> Result<()> {
        let mut handlers = self.handlers.write();
        let slot = handle
            .0
            .checked_sub(1)
            .and_then(|index| handlers.get_mut(index as usize))
            .ok_or(RuntimeError::InvalidHandle(handle.0))?;
        *slot = None;
        Ok(())
    }

    /// Deliver `message` to every enabled subscriber whose mask shares a
    /// level with `levels`. Callbacks run outside the registry lock.
    pub fn publish(&self, levels: LogLevel, message: &str) -> Result<()> {
        let levels = levels & LogLevel::all();
        if levels.is_empty() {
            return Err(RuntimeError::invalid_value("log message needs at least one level"));
        }

        let targets: Vec<LogCallback> = self
            .handlers
            .read()
            .iter()
            .flatten()
            .filter(|handler| handler.flags.intersects(levels))
            .map(|handler| handler.callback.clone())
            .collect();

        for callback in targets {
            callback.call(levels, message);
        }
        Ok(())
    }

    /// Number of enabled subscriptions
    pub fn active_handlers(&self) -> usize {
        self.handlers.read().iter().flatten().count()
    }

    fn emit(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::ERROR => tracing::error!(target: "anydsl_runtime", "{message}"),
            LogLevel::WARNING => tracing::warn!(target: "anydsl_runtime", "{message}"),
            LogLevel::INFO => tracing::info!(target: "anydsl_runtime", "{message}"),
            LogLevel::DEBUG => tracing::debug!(target: "anydsl_runtime", "{message}"),
            _ => tracing::trace!(target: "anydsl_runtime", "{message}"),
        }
        // A single non-empty level cannot be rejected.
        let _ = self.publish(level, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::ERROR, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::WARNING, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::INFO, message.as_ref());
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::DEBUG, message.as_ref());
    }

    pub fn trace(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::TRACE, message.as_ref());
    }
}

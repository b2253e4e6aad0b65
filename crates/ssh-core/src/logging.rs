//! Logging capability handed to every fabric component.
//!
//! Components never call a global logger; they receive a [`SharedLogger`] and
//! emit through the `fabric_*!` macros. [`NoopLogger`] is the default,
//! [`TracingLogger`] forwards to `tracing` for the CLI. A log call never blocks
//! and never fails the operation it annotates.

use std::{fmt, sync::Arc};

use tracing::Level;

pub trait Logger: Send + Sync + 'static {
    fn log(&self, level: Level, message: fmt::Arguments<'_>);
}

pub type SharedLogger = Arc<dyn Logger>;

impl<L: Logger + ?Sized> Logger for Arc<L> {
    fn log(&self, level: Level, message: fmt::Arguments<'_>) {
        (**self).log(level, message)
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: Level, _message: fmt::Arguments<'_>) {}
}

/// Emits each record as a `tracing` event under the `hopchain` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: fmt::Arguments<'_>) {
        match level {
            Level::ERROR => tracing::error!(target: "hopchain", "{message}"),
            Level::WARN => tracing::warn!(target: "hopchain", "{message}"),
            Level::INFO => tracing::info!(target: "hopchain", "{message}"),
            Level::DEBUG => tracing::debug!(target: "hopchain", "{message}"),
            _ => tracing::trace!(target: "hopchain", "{message}"),
        }
    }
}

pub fn noop() -> SharedLogger {
    Arc::new(NoopLogger)
}

pub fn tracing_logger() -> SharedLogger {
    Arc::new(TracingLogger)
}

#[macro_export]
macro_rules! fabric_log {
    ($logger:expr, $level:expr, $($arg:tt)+) => {
        $crate::logging::Logger::log(&*$logger, $level, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! fabric_error {
    ($logger:expr, $($arg:tt)+) => { $crate::fabric_log!($logger, ::tracing::Level::ERROR, $($arg)+) };
}

#[macro_export]
macro_rules! fabric_warn {
    ($logger:expr, $($arg:tt)+) => { $crate::fabric_log!($logger, ::tracing::Level::WARN, $($arg)+) };
}

#[macro_export]
macro_rules! fabric_info {
    ($logger:expr, $($arg:tt)+) => { $crate::fabric_log!($logger, ::tracing::Level::INFO, $($arg)+) };
}

#[macro_export]
macro_rules! fabric_debug {
    ($logger:expr, $($arg:tt)+) => { $crate::fabric_log!($logger, ::tracing::Level::DEBUG, $($arg)+) };
}

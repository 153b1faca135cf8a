//! Structured logging utilities for the vrift store components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//! Field values are recorded through their `Display` impl.
//!
//! # Usage
//!
//! ```ignore
//! use vrift_config::{log_gc_info, log_remote_warn};
//!
//! log_gc_info!("Collection finished", evicted = 12, freed_bytes = 4096);
//! log_remote_warn!("Retrying request", op = "find_missing", attempt = 2);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const LOCAL: &'static str = "LOCAL";
    pub const REMOTE: &'static str = "REMOTE";
    pub const GC: &'static str = "GC";
    pub const STORE: &'static str = "STORE";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// === LOCAL logging macros ===

#[macro_export]
macro_rules! log_local_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "LOCAL", $($key = tracing::field::display(&$value),)* $msg)
    };
}

#[macro_export]
macro_rules! log_local_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "LOCAL", $($key = tracing::field::display(&$value),)* $msg)
    };
}

// === REMOTE logging macros ===

#[macro_export]
macro_rules! log_remote_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "REMOTE", $($key = tracing::field::display(&$value),)* $msg)
    };
}

#[macro_export]
macro_rules! log_remote_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "REMOTE", $($key = tracing::field::display(&$value),)* $msg)
    };
}

#[macro_export]
macro_rules! log_remote_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "REMOTE", $($key = tracing::field::display(&$value),)* $msg)
    };
}

// === GC logging macros ===

#[macro_export]
macro_rules! log_gc_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "GC", $($key = tracing::field::display(&$value),)* $msg)
    };
}

#[macro_export]
macro_rules! log_gc_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "GC", $($key = tracing::field::display(&$value),)* $msg)
    };
}

// === STORE logging macros ===

#[macro_export]
macro_rules! log_store_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "STORE", $($key = tracing::field::display(&$value),)* $msg)
    };
}

#[macro_export]
macro_rules! log_store_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "STORE", $($key = tracing::field::display(&$value),)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup; `RUST_LOG` takes precedence.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // A second call (e.g. from another test) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

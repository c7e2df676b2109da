//! Replay-aware logging for orchestration code.
//!
//! Orchestrations re-execute from the beginning on every turn, so a plain
//! `tracing::info!` inside one would repeat on each replay. Messages go through
//! `OrchestrationContext::trace_*` (buffered, flushed by the runtime after the
//! turn) or the `durable_*` macros (logged immediately), both of which drop
//! output while the context is replaying.

use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emit the messages an orchestration buffered during one turn.
pub(crate) fn flush_turn_logs(instance: &str, orchestration: &str, turn_index: u64, logs: Vec<(LogLevel, String)>) {
    for (level, msg) in logs {
        match level {
            LogLevel::Debug => debug!(instance, orchestration, turn_index, "{msg}"),
            LogLevel::Info => info!(instance, orchestration, turn_index, "{msg}"),
            LogLevel::Warn => warn!(instance, orchestration, turn_index, "{msg}"),
            LogLevel::Error => error!(instance, orchestration, turn_index, "{msg}"),
        }
    }
}

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Does nothing when the host already installed a global subscriber.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::debug!(turn_index = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(turn_index = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(turn_index = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(turn_index = $ctx.turn_index(), $($arg)+);
        }
    }};
}

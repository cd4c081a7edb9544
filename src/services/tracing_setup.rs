//! Tracing subscriber setup
//!
//! The library itself only emits `tracing` events. Hosts that want them in a
//! log file, and tests that want to inspect them, build a subscriber here.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber, logging to `log_file_path`.
///
/// Filtering follows `RUST_LOG`, with `level` as the default. Returns false
/// if the file could not be created or a global subscriber already exists.
pub fn init_global(log_file_path: &Path, level: tracing::Level) -> bool {
    let Ok(log_file) = File::create(log_file_path) else {
        return false;
    };
    build_subscriber(log_file, level).try_init().is_ok()
}

/// Build a subscriber writing formatted events to `log_file`.
///
/// This is the configuration shared between hosts and tests.
pub fn build_subscriber(
    log_file: File,
    level: tracing::Level,
) -> impl tracing::Subscriber + Send + Sync {
    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    let fmt_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(log_file));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
}

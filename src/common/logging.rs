//! Logging and tracing configuration
//!
//! Provides structured logging for both sides of the process boundary.
//! The child logs to a file inside the session home since its stdout and
//! stderr are relayed to the parent's streams.

use std::path::{Path, PathBuf};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Initialize tracing for the parent test process (stdout logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
/// Safe to call more than once; later calls are no-ops.
pub fn init_harness() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("remotestep=info,warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();
}

/// Initialize tracing for the child process (file + stderr logging)
///
/// The child logs to both:
/// 1. `<home>/logs/remote.log` for post-mortem inspection
/// 2. stderr, which the parent relays with the session prefix
pub fn init_remote(home: &Path) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("remotestep=debug,info"));

    let log_dir = home.join("logs");
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let log_file = log_dir.join("remote.log");

        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
        {
            Ok(file) => {
                let file_layer = fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true);

                let stderr_layer = fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .compact();

                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(file_layer)
                    .with(stderr_layer)
                    .try_init();

                return Some(log_file);
            }
            Err(e) => {
                eprintln!("Warning: could not open remote log file: {}", e);
            }
        }
    }

    // Fallback: stderr only
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true),
        )
        .try_init();

    None
}

//! Process-wide logging setup on top of `tracing`.
//!
//! The level comes from `VM_LOG_LEVEL` (syslog-style names accepted),
//! default `info`, read when the subscriber is installed. Foreground
//! commands log to stderr; the daemon additionally appends to the VM's
//! log file. Installation happens at most once per process.

use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding the log level.
pub const LOG_LEVEL_ENV: &str = "VM_LOG_LEVEL";

/// One-shot guard so repeated init calls are harmless.
static INSTALLED: OnceLock<()> = OnceLock::new();

/// Maps a `VM_LOG_LEVEL` value onto a tracing directive.
fn level_directive(value: &str) -> &'static str {
    match value.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warning" | "warn" => "warn",
        "error" | "critical" => "error",
        // `notice` has no tracing equivalent; fold it into info.
        _ => "info",
    }
}

/// Builds the filter from the environment.
fn filter() -> EnvFilter {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_default();
    EnvFilter::new(level_directive(&level))
}

/// Installs stderr-only logging for foreground commands.
pub fn init_cli() {
    INSTALLED.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init();
    });
}

/// Installs daemon logging: stderr plus the VM's append-only log file.
///
/// Every component's logger picks the file up through the global
/// subscriber, so this must run before anything else logs.
pub fn init_daemon(log_path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    INSTALLED.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .try_init();
    });
    Ok(())
}

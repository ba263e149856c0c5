//! Tracing setup for the worker process.
//!
//! Logs go to `<home>/logs/broker.log` with daily rotation, filtered by
//! `RUST_LOG` (default `info`). Idempotent: later calls are no-ops once a
//! writer guard is stashed in [`LOG_GUARD`].
//!
//! Only the Broker half calls this. The Jail half inherits the same file
//! descriptor from before the fork and never reinitializes tracing after
//! the seccomp filter is installed: opening a new log file at that point
//! would itself be a trapped `openat`, and the post-fork trap handler must
//! never call into `tracing` at all (spec.md §4.1's signal-reentrancy
//! rule: the handler can run recursively and must stay allocation-free).

use std::path::Path;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

pub fn init_logging(home_dir: &Path) -> anyhow::Result<()> {
    let logs_dir = home_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)?;

    let _ = LOG_GUARD.get_or_init(|| {
        let file_appender = tracing_appender::rolling::daily(&logs_dir, "broker.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .try_init();

        guard
    });

    Ok(())
}

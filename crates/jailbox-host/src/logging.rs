//! Tracing setup for the Host process.
//!
//! Logs go to `<home>/logs/host.log` with daily rotation, filtered by
//! `RUST_LOG` (default `info`). Idempotent: later calls are no-ops once a
//! writer guard is stashed in [`LOG_GUARD`]. A separate log file per
//! process role (see `jailbox_worker::logging` for the Broker's) keeps
//! the three processes' output from interleaving on disk.

use std::path::Path;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// `force_debug` is the CLI's `--debug` flag (`GlobalFlags::debug`): when
/// set it overrides `RUST_LOG` with `debug` rather than merely supplying
/// a default, since a user passing `--debug` expects it to win.
pub fn init_logging(home_dir: &Path, force_debug: bool) -> anyhow::Result<()> {
    let logs_dir = home_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)?;

    let _ = LOG_GUARD.get_or_init(|| {
        let file_appender = tracing_appender::rolling::daily(&logs_dir, "host.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let env_filter = if force_debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .unwrap_or_else(|_| EnvFilter::new("info"))
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .try_init();

        guard
    });

    Ok(())
}

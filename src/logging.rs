//! Logging setup for the pinbook binary.
//!
//! The library emits structured `tracing` events: pin creation and deletion
//! at `info` (with `pin_id` and coordinates), album loads at `info` and load
//! failures at `warn`, image download failures at `warn` with the `url`, and
//! failed commits at `error`. Superseded background results, rejected
//! duplicate downloads and cancellations are `debug` only.
//!
//! Events go to systemd's journal when it is reachable and to a daily rolling
//! `pinbook.log` otherwise.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// Log level is read from `PINBOOK_LOG` (e.g. `PINBOOK_LOG=debug`,
/// `PINBOOK_LOG=pinbook::download=trace`) and defaults to `info`.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::try_from_env("PINBOOK_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .try_init()?;

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pinbook")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "pinbook.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the appender's flush guard for the whole run
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::info!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}

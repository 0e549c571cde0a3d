//! Tracing setup for the driver binary
//!
//! Two profiles: a stdout-only subscriber for short-lived commands, and a
//! long-running profile that additionally writes daily-rotated files under
//! `~/.shardsync/logs`. `RUST_LOG` overrides the requested level in both.

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE: &str = "sync.log";

fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn stdout_layer<S>() -> fmt::Layer<S> {
    fmt::layer().with_target(false).with_line_number(false)
}

/// Set up logging for a long-running session: stdout plus a daily-rotated
/// file. The file layer carries targets and line numbers; stdout stays
/// compact. `log_dir` defaults to `~/.shardsync/logs`.
pub fn init_production_logging(level: &str, log_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shardsync")
            .join("logs")
    });
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE);
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        // ANSI escapes would end up verbatim in the files
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(level_filter(level))
        .with(file_layer)
        .with(stdout_layer().with_writer(std::io::stdout))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    tracing::info!(log_dir = %log_dir.display(), level, "logging to stdout and rotating file");
    Ok(())
}

/// Stdout-only logging for one-shot commands and tests
pub fn init_simple_logging(level: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(level_filter(level))
        .with(stdout_layer().with_writer(std::io::stdout))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))
}

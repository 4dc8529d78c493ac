//! Logging bootstrap
//!
//! Console output is always on. When `logging.dir` is set, a daily rolling
//! `dlock.log` is written there as well. `RUST_LOG` overrides the configured
//! level for both.

use std::path::PathBuf;

use dlock_core::LoggingSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const LOG_FILE: &str = "dlock.log";

/// Keeps the file writer alive; buffered output is flushed on drop.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

pub fn init_logging(settings: &LoggingSettings) -> anyhow::Result<LoggingGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_filter(filter(&settings.level));
    layers.push(Box::new(console_layer));

    let mut file_guard = None;
    if let Some(dir) = &settings.dir {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, &dir, LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(filter(&settings.level));
        layers.push(Box::new(file_layer));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    if let Some(dir) = &settings.dir {
        tracing::info!(log_dir = %dir, "File logging initialized");
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

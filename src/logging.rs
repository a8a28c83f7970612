//! Tracing setup for the `mender` binary.
//!
//! Console output goes to stderr through an `EnvFilter` read from `MENDER_LOG`.
//! When a log directory is given, a daily-rolling file is written alongside it
//! through a non-blocking writer.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_ENV: &str = "MENDER_LOG";
const LOG_FILE_PREFIX: &str = "mender.log";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub json: bool,
    /// Directory for the rolling log file; console only when `None`.
    pub file_dir: Option<PathBuf>,
}

/// Filter directive used when `MENDER_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "mender=debug,info" } else { "info" }
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered file output is flushed.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let (file_writer, guard) = match &options.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
    });

    let registry = tracing_subscriber::registry()
        .with(env_filter(options.verbose))
        .with(file_layer);

    let result = if options.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    result.context("Failed to install tracing subscriber")?;

    Ok(guard)
}

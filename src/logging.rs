//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the level comes from [`SyncConfig::debug`].

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::SyncConfig;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {source}")]
    OpenLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

#[must_use]
pub fn default_directive(config: &SyncConfig) -> &'static str {
    if config.debug {
        "debug"
    } else {
        "info"
    }
}

#[must_use]
pub fn env_filter(config: &SyncConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(config)))
}

/// Builds the subscriber without installing it.
pub fn build_subscriber<W>(
    filter: EnvFilter,
    writer: W,
    ansi: bool,
) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(ansi))
}

/// Installs the global subscriber, writing to the configured log file or stderr.
pub fn init(config: &SyncConfig) -> Result<(), LoggingError> {
    let filter = env_filter(config);
    let installed = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::OpenLog {
                    path: PathBuf::from(path),
                    source,
                })?;
            build_subscriber(filter, Arc::new(file), false).try_init()
        }
        None => build_subscriber(filter, io::stderr, true).try_init(),
    };
    installed.map_err(|_| LoggingError::AlreadyInstalled)
}

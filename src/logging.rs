//! Explicit tracing initialisation.
//!
//! Library code only emits events through `tracing` macros. The subscriber is
//! installed by the binary from a [`LoggingConfig`]; nothing in the core relies
//! on a process-wide logger being present.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{LogSink, LoggingConfig};

/// Build the event filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global subscriber described by `config`.
///
/// For file sinks the returned guard must be kept alive until shutdown so
/// buffered lines are flushed.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(config));

    match &config.sink {
        LogSink::Stderr => {
            builder
                .with_ansi(config.ansi)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to install stderr subscriber")?;
            Ok(None)
        }
        LogSink::Stdout => {
            builder
                .with_ansi(config.ansi)
                .with_writer(std::io::stdout)
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to install stdout subscriber")?;
            Ok(None)
        }
        LogSink::File(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Log sink {} has no file name", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            builder
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to install file subscriber")?;
            Ok(Some(guard))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_file_sink_without_name_rejected() {
        let config = LoggingConfig {
            sink: LogSink::File(PathBuf::from("/")),
            ..LoggingConfig::default()
        };
        let err = init_tracing(&config).unwrap_err();
        assert!(err.to_string().contains("has no file name"));
    }
}

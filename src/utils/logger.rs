//! Logging setup
//!
//! Both daemons log through `tracing`. [`LoggingConfig`] picks the default
//! level, one of three output formats, and optionally a log file; file
//! output is daily-rolled, named after the configured file, and written
//! alongside the console.

use std::path::Path;

use tracing::{info, Level};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::{Error, Result};

/// Install the global subscriber.
///
/// Returns the file writer's guard when file logging is enabled; the
/// caller keeps it alive for the daemon's lifetime so buffered lines are
/// flushed on shutdown.
pub fn setup_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let registry = tracing_subscriber::registry().with(level_filter(&config.level)?);

    let guard = match &config.file {
        Some(file) => {
            let (writer, guard) = file_writer(Path::new(file))?;
            registry
                .with(format_layer(config.format, writer))
                .with(format_layer(config.format, std::io::stdout))
                .init();
            Some(guard)
        }
        None => {
            registry
                .with(format_layer(config.format, std::io::stdout))
                .init();
            None
        }
    };

    info!(level = %config.level, format = ?config.format, "logging initialised");
    Ok(guard)
}

/// RUST_LOG still wins; the configured level is only the default.
fn level_filter(level: &str) -> Result<EnvFilter> {
    let level: Level = level
        .parse()
        .map_err(|_| Error::parse(format!("Invalid log level: {}", level)))?;
    Ok(EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy())
}

/// Daily-rolling writer in the configured file's directory, with the
/// file's stem as the roll prefix.
fn file_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::parse(format!("Invalid log file path: {}", path.display())))?;

    let appender = rolling::RollingFileAppender::builder()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(directory)
        .map_err(|e| Error::internal(format!("Cannot open log directory: {}", e)))?;

    Ok(non_blocking(appender))
}

fn format_layer<S, W>(format: LogFormat, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Full => layer.boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_accepts_any_case() {
        assert!(level_filter("info").is_ok());
        assert!(level_filter("DEBUG").is_ok());
        assert!(level_filter("Error").is_ok());
        assert!(level_filter("shouting").is_err());
    }

    #[test]
    fn test_file_writer_uses_configured_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.log");
        let (_writer, _guard) = file_writer(&path).unwrap();

        // the appender creates its first rolled file up front
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        assert!(
            names.iter().any(|n| n.starts_with("switchboard.")),
            "no rolled file in {:?}",
            names
        );
    }

    #[test]
    fn test_bare_filename_rolls_in_cwd() {
        // a path without a directory component must not error
        let result = file_writer(Path::new("roll-test.log"));
        assert!(result.is_ok());
        // clean up whatever the appender created in the working directory
        if let Ok(entries) = std::fs::read_dir(".") {
            for entry in entries.filter_map(|e| e.ok()) {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("roll-test.")
                {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }
}

//! Logging configuration and initialization.
//!
//! Sets up the tracing subscriber from [`LoggingConfig`], writing to stdout,
//! stderr or an append-only file through a non-blocking writer.

use crate::config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use std::io;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Dependencies that are too chatty below `warn` unless asked for.
const QUIET_DEPENDENCIES: &str = "hyper=warn,hyper_util=warn,h2=warn";

/// Initializes the logging system.
///
/// The returned guard must be held until exit so buffered records are
/// flushed. `RUST_LOG`, when set, replaces the computed filter.
///
/// # Arguments
///
/// * `config` - The logging configuration
/// * `level_override` - Level chosen on the command line, if any
/// * `trace_deps` - Also emit dependency logs at the chosen level
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<&str>,
    trace_deps: bool,
) -> io::Result<WorkerGuard> {
    let level = level_override.unwrap_or(config.level.as_str()).to_lowercase();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&level, trace_deps)));

    let (writer, guard) = make_writer(&config.output)?;

    match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_writer(writer)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
    }

    Ok(guard)
}

/// Builds the filter for `level`, quieting dependencies unless `trace_deps`.
fn filter_directives(level: &str, trace_deps: bool) -> String {
    let level = match level {
        "trace" | "debug" | "info" | "warn" | "error" => level,
        _ => "info",
    };

    if trace_deps {
        level.to_string()
    } else {
        format!("{level},{QUIET_DEPENDENCIES}")
    }
}

fn make_writer(output: &str) -> io::Result<(NonBlocking, WorkerGuard)> {
    Ok(match output.to_lowercase().as_str() {
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        "stderr" => tracing_appender::non_blocking(io::stderr()),
        _ => {
            let file = OpenOptions::new().create(true).append(true).open(output)?;
            tracing_appender::non_blocking(file)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_filter_directives() {
        assert_eq!(
            filter_directives("debug", false),
            "debug,hyper=warn,hyper_util=warn,h2=warn"
        );
        assert_eq!(filter_directives("trace", true), "trace");
        assert!(filter_directives("verbose", false).starts_with("info,"));
    }

    #[test]
    fn test_file_writer_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("proxy.log");

        let (_writer, guard) = make_writer(path.to_str().unwrap()).unwrap();
        drop(guard);

        assert!(path.exists());
    }

    #[test]
    fn test_file_writer_reports_bad_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("proxy.log");
        assert!(make_writer(path.to_str().unwrap()).is_err());
    }
}

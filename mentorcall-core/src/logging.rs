use std::fs::OpenOptions;
use std::sync::Arc;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Output format of the session log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One compact line per event, for terminals
    Pretty,
    /// One JSON object per event, for log shippers
    Json,
}

impl LogFormat {
    fn parse(format: &str) -> anyhow::Result<Self> {
        match format.to_lowercase().as_str() {
            "pretty" | "compact" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {format}")),
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` overrides the configured level. Fails if a subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    build_subscriber(config)?.try_init()?;
    Ok(())
}

/// Subscriber for `config` without installing it
///
/// Session fields (`session_id`, `peer`, `call_id`, `state`) are recorded
/// as structured fields in both formats.
pub fn build_subscriber(config: &LoggingConfig) -> anyhow::Result<impl Subscriber + Send + Sync> {
    let level = parse_log_level(&config.level)?;
    let format = LogFormat::parse(&config.format)?;
    let to_file = config.file_path.is_some();
    let writer = make_writer(config.file_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .compact()
            .with_target(true)
            .with_ansi(!to_file)
            .with_writer(writer)
            .boxed(),
    };

    Ok(tracing_subscriber::registry().with(layer).with(filter))
}

/// Stdout, or the given file opened for appending
fn make_writer(file_path: Option<&str>) -> anyhow::Result<BoxMakeWriter> {
    match file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(BoxMakeWriter::new(Arc::new(file)))
        }
        None => Ok(BoxMakeWriter::new(std::io::stdout)),
    }
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config(format: &str, path: &std::path::Path) -> LoggingConfig {
        LoggingConfig {
            level: "info".to_string(),
            format: format.to_string(),
            file_path: Some(path.to_string_lossy().to_string()),
        }
    }

    #[test]
    fn test_parse_log_level() {
        assert!(parse_log_level("trace").is_ok());
        assert!(parse_log_level("DEBUG").is_ok());
        assert!(parse_log_level("warning").is_ok());
        assert!(parse_log_level("error").is_ok());
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_parse_log_format() {
        assert_eq!(LogFormat::parse("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty").unwrap(), LogFormat::Pretty);
        assert!(LogFormat::parse("xml").is_err());
    }

    #[test]
    fn test_init_rejects_bad_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_json_events_are_appended_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        std::fs::write(&path, "earlier run\n").unwrap();

        let subscriber = build_subscriber(&file_config("json", &path)).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(session_id = "abc123", peer = "p-rahul", "Peer left");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("earlier run"));

        let event: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(event["level"], "WARN");
        assert_eq!(event["fields"]["message"], "Peer left");
        assert_eq!(event["fields"]["session_id"], "abc123");
    }

    #[test]
    fn test_pretty_file_output_has_no_ansi_codes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");

        let subscriber = build_subscriber(&file_config("pretty", &path)).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(session_id = "abc123", "Negotiation timed out");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Negotiation timed out"));
        assert!(contents.contains("session_id"));
        assert!(!contents.contains('\u{1b}'));
    }

    #[test]
    fn test_unwritable_log_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("session.log");
        assert!(build_subscriber(&file_config("json", &path)).is_err());
    }
}

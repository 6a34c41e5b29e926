//! Structured logging for the sqlgate server
//!
//! Pretty console output for development, JSON for production, and optional
//! daily-rotated log files. Driven by the `logging` config section, which
//! `RUST_LOG`, `LOG_FORMAT`, `LOG_OUTPUT` and `LOG_DIR` override.

use crate::config::LoggingConfig;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE: &str = "sqlgate-server.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format for development
    Pretty,
    /// JSON format for production (structured logging)
    Json,
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File,
    Both,
}

impl LogOutput {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Stdout,
        }
    }
}

fn env_filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    // Filter out noisy third-party crates
    for directive in ["hyper=warn", "tokio=warn", "runtime=warn", "tower=warn", "h2=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

fn file_appender(directory: &str) -> RollingFileAppender {
    std::fs::create_dir_all(directory).ok();
    RollingFileAppender::new(Rotation::DAILY, directory, LOG_FILE)
}

/// Install the global subscriber
///
/// ```bash
/// # Development: pretty console output at debug level
/// RUST_LOG=debug LOG_FORMAT=pretty sqlgate-server
///
/// # Production: JSON to file with info level
/// RUST_LOG=info LOG_FORMAT=json LOG_OUTPUT=file LOG_DIR=/var/log/sqlgate sqlgate-server
/// ```
pub fn init(config: &LoggingConfig) {
    let format = LogFormat::parse(&config.format);
    let output = LogOutput::parse(&config.output);
    let filter = env_filter(&config.level);

    let stdout_layer = match format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_ids(true)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    match output {
        LogOutput::Stdout => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .init();
        }
        LogOutput::File => {
            let file_layer = fmt::layer()
                .with_writer(file_appender(&config.directory))
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(file_layer)
                .init();
        }
        LogOutput::Both => {
            let file_layer = fmt::layer()
                .with_writer(file_appender(&config.directory))
                .with_ansi(false)
                .boxed();
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
        }
    }

    tracing::info!(
        format = ?format,
        output = ?output,
        level = %config.level,
        "Logging system initialized"
    );
    if matches!(output, LogOutput::File | LogOutput::Both) {
        tracing::debug!(directory = %config.directory, "Writing log files");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Pretty);
    }

    #[test]
    fn test_log_output_parse() {
        assert_eq!(LogOutput::parse("file"), LogOutput::File);
        assert_eq!(LogOutput::parse("both"), LogOutput::Both);
        assert_eq!(LogOutput::parse("stdout"), LogOutput::Stdout);
        assert_eq!(LogOutput::parse(""), LogOutput::Stdout);
    }
}

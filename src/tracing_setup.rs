//! Tracing Infrastructure
//!
//! Sets up the global `tracing` subscriber for the station:
//! - Multiple output formats (pretty, compact, JSON)
//! - Environment-based filtering (`RUST_LOG` overrides the configured level)
//! - Span events, source locations and thread details, all off by default
//!   except thread names
//! - Idempotent initialization, safe to call from tests
//!
//! # Example
//! ```no_run
//! use rust_station::{config::StationConfig, tracing_setup};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StationConfig::load_from("station.toml")?;
//! tracing_setup::init_from_config(&config)?;
//! tracing::info!("Station starting");
//! # Ok(())
//! # }
//! ```

use crate::config::{LoggingOptions, StationConfig};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer, Registry,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    #[default]
    Pretty,
    /// Compact format without colors
    Compact,
    /// JSON format for log aggregation
    Json,
}

/// Resolved subscriber settings
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// Emit span NEW and CLOSE events
    pub with_span_events: bool,
    pub with_file_and_line: bool,
    pub with_thread_ids: bool,
    pub with_thread_names: bool,
    /// ANSI colours (pretty format only)
    pub with_ansi: bool,
}

impl TracingConfig {
    /// Resolve the `[logging]` table, rejecting unknown levels
    pub fn from_options(options: &LoggingOptions) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&options.level)?,
            format: options.format,
            with_span_events: options.span_events,
            with_file_and_line: options.file_and_line,
            with_thread_ids: options.thread_ids,
            with_thread_names: options.thread_names,
            with_ansi: options.ansi,
        })
    }

    pub fn from_station_config(config: &StationConfig) -> Result<Self, String> {
        Self::from_options(&config.logging)
    }
}

/// Initialize tracing from the station configuration
pub fn init_from_config(config: &StationConfig) -> Result<(), String> {
    init(TracingConfig::from_station_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a global subscriber is already installed this returns
/// `Ok(())`.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    // Location and thread flags go after the format switch, which resets them
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(config.with_ansi)
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_ids(config.with_thread_ids)
            .with_thread_names(config.with_thread_names)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_ids(config.with_thread_ids)
            .with_thread_names(config.with_thread_names)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_ids(config.with_thread_ids)
            .with_thread_names(config.with_thread_names)
            .boxed(),
    };

    tolerate_existing(
        tracing_subscriber::registry()
            .with(layer.with_filter(env_filter))
            .try_init(),
    )
}

/// Tests and embedders routinely install a subscriber first
fn tolerate_existing(result: Result<(), TryInitError>) -> Result<(), String> {
    result.or_else(|e| {
        if e
            .to_string()
            .contains("a global default trace dispatcher has already been set")
        {
            Ok(())
        } else {
            Err(format!("Failed to initialize tracing: {}", e))
        }
    })
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("WARN"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_tracing_config_from_station_config() {
        let mut config = StationConfig::default();
        config.logging.level = "debug".to_string();
        config.logging.format = OutputFormat::Json;
        config.logging.file_and_line = true;
        config.logging.ansi = false;

        let tracing_config = TracingConfig::from_station_config(&config).unwrap();
        assert!(matches!(tracing_config.level, Level::DEBUG));
        assert_eq!(tracing_config.format, OutputFormat::Json);
        assert!(tracing_config.with_file_and_line);
        assert!(!tracing_config.with_ansi);
        assert!(tracing_config.with_thread_names);
        assert!(!tracing_config.with_span_events);
    }

    #[test]
    fn test_init_is_idempotent() {
        let options = LoggingOptions {
            level: "warn".to_string(),
            format: OutputFormat::Compact,
            span_events: true,
            thread_ids: true,
            ..LoggingOptions::default()
        };
        let config = TracingConfig::from_options(&options).unwrap();
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}

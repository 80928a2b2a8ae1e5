//! Station Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `STATION_`, nested keys separated
//!    by `__` (e.g. `STATION_RETRY__MAX_ATTEMPTS=5`)
//!
//! Durations are human-readable strings (`"200ms"`, `"2s"`).
//!
//! # Example
//! ```no_run
//! use rust_station::config::StationConfig;
//!
//! let config = StationConfig::load_from("station.toml")?;
//! println!("{} slots on {}", config.slot_count, config.station_name);
//! # Ok::<(), rust_station::error::StationError>(())
//! ```

use crate::error::{StationError, StationResult};
use crate::instruments::{
    HealthCheckOptions, InstrumentManagerConfig, InstrumentTimeouts, MockInstrumentOptions,
};
use crate::policy::{CircuitBreakerOptions, RetryOptions};
use crate::sequence::FailurePolicy;
use crate::steps::{PluginOptions, StepPlanEntry};
use crate::tracing_setup::{parse_log_level, OutputFormat};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level station configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default = "default_station_name")]
    pub station_name: String,
    /// Number of parallel slots (>= 1)
    #[serde(default = "default_slot_count")]
    pub slot_count: u32,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Ordered steps every slot runs
    #[serde(default = "default_step_plan")]
    pub step_plan: Vec<StepPlanEntry>,
    #[serde(default)]
    pub timeouts: InstrumentTimeouts,
    #[serde(default)]
    pub retry: RetryOptions,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerOptions,
    #[serde(default)]
    pub health: HealthCheckOptions,
    #[serde(default)]
    pub plugins: PluginOptions,
    /// Limit table loaded before the run; no limits when unset
    #[serde(default)]
    pub limits_csv: Option<PathBuf>,
    #[serde(default = "default_report_root")]
    pub report_root: PathBuf,
    /// Recorded in every run manifest
    #[serde(default)]
    pub operator_id: Option<String>,
    #[serde(default)]
    pub logging: LoggingOptions,
    #[serde(default)]
    pub mock: MockInstrumentOptions,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingOptions {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: OutputFormat,
    /// Log span open and close events
    #[serde(default)]
    pub span_events: bool,
    /// Include source file and line
    #[serde(default)]
    pub file_and_line: bool,
    #[serde(default)]
    pub thread_ids: bool,
    #[serde(default = "default_true")]
    pub thread_names: bool,
    /// Colour output of the pretty format
    #[serde(default = "default_true")]
    pub ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
            span_events: false,
            file_and_line: false,
            thread_ids: false,
            thread_names: true,
            ansi: true,
        }
    }
}

// Default value functions
fn default_station_name() -> String {
    "Station".to_string()
}

fn default_slot_count() -> u32 {
    4
}

fn default_step_plan() -> Vec<StepPlanEntry> {
    ["Safety", "PowerUp", "CommUp", "Measure", "Evaluate"]
        .into_iter()
        .map(StepPlanEntry::from)
        .collect()
}

fn default_report_root() -> PathBuf {
    PathBuf::from("reports")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            station_name: default_station_name(),
            slot_count: default_slot_count(),
            failure_policy: FailurePolicy::default(),
            step_plan: default_step_plan(),
            timeouts: InstrumentTimeouts::default(),
            retry: RetryOptions::default(),
            circuit_breaker: CircuitBreakerOptions::default(),
            health: HealthCheckOptions::default(),
            plugins: PluginOptions::default(),
            limits_csv: None,
            report_root: default_report_root(),
            operator_id: None,
            logging: LoggingOptions::default(),
            mock: MockInstrumentOptions::default(),
        }
    }
}

impl StationConfig {
    /// Load from a TOML file plus `STATION_` environment overrides, then
    /// validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> StationResult<Self> {
        // Figment treats a missing file as empty
        if !path.as_ref().is_file() {
            return Err(StationError::Configuration(format!(
                "Config file not found: {:?}",
                path.as_ref()
            )));
        }
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STATION_").split("__"))
            .extract()?;
        config.validate().map_err(StationError::Configuration)?;
        Ok(config)
    }

    /// Parse and validate a TOML document (no environment overrides)
    pub fn from_toml_str(toml: &str) -> StationResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate().map_err(StationError::Configuration)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.slot_count < 1 {
            return Err("slot_count must be at least 1".to_string());
        }
        if self.retry.max_attempts < 1 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.circuit_breaker.failure_threshold < 1 {
            return Err("circuit_breaker.failure_threshold must be at least 1".to_string());
        }

        let timeouts = [
            ("timeouts.dmm", self.timeouts.dmm),
            ("timeouts.psu", self.timeouts.psu),
            ("timeouts.can", self.timeouts.can),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(format!("{} must be greater than zero", name));
        }

        if self.step_plan.is_empty() {
            return Err("step_plan must name at least one step".to_string());
        }
        if let Some(entry) = self.step_plan.iter().find(|e| e.step_id().trim().is_empty()) {
            return Err(format!("step_plan contains a blank step id: {:?}", entry));
        }

        if self.health.enabled
            && (self.health.interval == Duration::ZERO || self.health.timeout == Duration::ZERO)
        {
            return Err("health.interval and health.timeout must be greater than zero".to_string());
        }

        parse_log_level(&self.logging.level)?;
        Ok(())
    }

    /// Instrument assembly settings for one slot
    pub fn instrument_config(&self, seed: u64) -> InstrumentManagerConfig {
        InstrumentManagerConfig {
            timeouts: self.timeouts,
            retry: self.retry,
            breaker: self.circuit_breaker,
            health: self.health,
            mocks: self.mock.clone(),
            seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_full_config() {
        let config = StationConfig::from_toml_str(
            r#"
            station_name = "Line 3"
            slot_count = 2
            failure_policy = "continue_on_fail"
            step_plan = ["Safety", { step = "PowerUp", parameters = { voltage = 5.0 } }]

            [timeouts]
            can = "250ms"

            [retry]
            max_attempts = 5
            delay = "10ms"

            [plugins]
            directory = "plugins"
            allowed_sha256 = ["abc"]

            [mock]
            can_transient_failures = 1
            require_reinitialize_after_failure = true

            [logging]
            format = "json"
            file_and_line = true
            ansi = false
            "#,
        )
        .unwrap();

        assert_eq!(config.station_name, "Line 3");
        assert_eq!(config.slot_count, 2);
        assert_eq!(config.failure_policy, FailurePolicy::ContinueOnFail);
        assert_eq!(config.step_plan.len(), 2);
        assert_eq!(config.step_plan[1].step_id(), "PowerUp");
        assert_eq!(config.timeouts.can, Duration::from_millis(250));
        assert_eq!(config.timeouts.dmm, Duration::from_secs(2));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.retry.exponential_backoff);
        assert_eq!(config.plugins.directory, Some(PathBuf::from("plugins")));
        assert_eq!(config.mock.can_transient_failures, 1);
        assert_eq!(config.logging.format, OutputFormat::Json);
        assert!(config.logging.file_and_line);
        assert!(!config.logging.ansi);
        assert!(config.logging.thread_names);
    }

    #[test]
    fn test_defaults_validate() {
        let config = StationConfig::from_toml_str("").unwrap();
        assert_eq!(config, StationConfig::default());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            "slot_count = 0",
            "step_plan = []",
            "[retry]\nmax_attempts = 0",
            "[circuit_breaker]\nfailure_threshold = 0",
            "[timeouts]\npsu = \"0s\"",
            "[health]\nenabled = true\ninterval = \"0s\"",
            "[logging]\nlevel = \"loud\"",
        ];
        for case in cases {
            let err = StationConfig::from_toml_str(case).unwrap_err();
            assert!(
                matches!(err, StationError::Configuration(_)),
                "{} should fail validation, got {}",
                case,
                err
            );
        }
    }

    #[test]
    fn test_misspelt_plan_parameters_are_rejected() {
        let err = StationConfig::from_toml_str(
            r#"step_plan = [{ step = "PowerUp", params = { voltage = 99.0 } }]"#,
        )
        .unwrap_err();
        assert!(matches!(err, StationError::Config(_)), "got {}", err);
        assert!(err.to_string().contains("params"), "{}", err);

        let config = StationConfig::from_toml_str(
            r#"step_plan = [{ step = "PowerUp", parameters = { voltage = 9.0 } }]"#,
        )
        .unwrap();
        assert_eq!(
            config.step_plan[0].parameters(),
            Some(&serde_json::json!({ "voltage": 9.0 }))
        );
    }

    #[test]
    fn test_disabled_health_may_have_zero_interval() {
        let config =
            StationConfig::from_toml_str("[health]\nenabled = false\ninterval = \"0s\"").unwrap();
        assert!(!config.health.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "slot_count = 3").unwrap();
        let config = StationConfig::load_from(file.path()).unwrap();
        assert_eq!(config.slot_count, 3);
    }
}

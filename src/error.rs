//! Custom error types for the station.
//!
//! This module defines the error types used across the station core. Using the
//! `thiserror` crate, each concern gets its own enum, and `StationError`
//! consolidates them for the outer layers (controller, CLI, report writers).
//!
//! ## Error Hierarchy
//!
//! - **`InstrumentError`**: Everything an instrument call can end with once it
//!   has passed through the policy layer:
//!   - `Device`: a transient failure raised by the device itself. Retried.
//!   - `Timeout`: the call exceeded its bound. Retried like a device failure but
//!     reported with its own message.
//!   - `BreakerOpen`: the circuit breaker rejected the call without touching
//!     the device.
//!   - `Exhausted`: every attempt failed; carries the last underlying error.
//!   - `Cancelled`: the caller's cancellation token fired. Never retried and
//!     never converted into a step outcome.
//! - **`BindError`**: A step's parameter payload did not match its declared
//!   shape. Reported at dispatch, before the step runs.
//! - **`PluginError`**: Plugin directory, loading, or plugin-side execution
//!   problems. Trust rejections are *not* errors; rejected files are skipped.
//! - **`StationError`**: Top-level error with `#[from]` conversions so the
//!   outer layers can use `?` throughout.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the station error type.
pub type StationResult<T> = std::result::Result<T, StationError>;

// =============================================================================
// Instrument Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("{instrument} {command} timed out after {timeout:?}")]
    Timeout {
        instrument: String,
        command: String,
        timeout: Duration,
    },

    #[error("Circuit breaker open for {instrument}; {command} blocked")]
    BreakerOpen { instrument: String, command: String },

    #[error("Retry policy exhausted after {attempts} attempts for {command}: {source}")]
    Exhausted {
        command: String,
        attempts: u32,
        #[source]
        source: Box<InstrumentError>,
    },

    #[error("Lease for {held} cannot be used for {requested}")]
    LeaseMismatch { held: String, requested: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Device(#[from] anyhow::Error),
}

impl InstrumentError {
    /// Convert a device-level error, recovering an `InstrumentError` that was
    /// raised by the device and boxed into `anyhow` on the way up.
    pub fn from_device(err: anyhow::Error) -> Self {
        match err.downcast::<InstrumentError>() {
            Ok(inner) => inner,
            Err(other) => InstrumentError::Device(other),
        }
    }

    /// True if this error represents a cancellation request.
    pub fn is_cancellation(&self) -> bool {
        match self {
            InstrumentError::Cancelled => true,
            InstrumentError::Device(inner) => is_cancelled(inner),
            _ => false,
        }
    }

    /// True for failures another attempt may cure: device errors and
    /// timeouts. Cancellations are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            InstrumentError::Device(inner) => !is_cancelled(inner),
            InstrumentError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// True for timeout-class failures (including device-raised timeouts).
    pub fn is_timeout(&self) -> bool {
        match self {
            InstrumentError::Timeout { .. } => true,
            InstrumentError::Exhausted { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

/// True if anywhere in the error chain a cancellation is recorded.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(instrument) = cause.downcast_ref::<InstrumentError>() {
            return matches!(instrument, InstrumentError::Cancelled);
        }
        matches!(
            cause.downcast_ref::<StationError>(),
            Some(StationError::Cancelled)
        )
    })
}

// =============================================================================
// Parameter Binding Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("Parameters for '{step}' must be a JSON object")]
    NotAnObject { step: String },

    #[error("Unknown parameter '{field}' for step '{step}'")]
    UnknownField { step: String, field: String },

    #[error("Missing required parameter '{field}' for step '{step}'")]
    MissingField { step: String, field: String },

    #[error("Parameter '{field}' for step '{step}' must be of type {expected}")]
    TypeMismatch {
        step: String,
        field: String,
        expected: String,
    },

    #[error("Invalid parameters for step '{step}': {message}")]
    Decode { step: String, message: String },
}

// =============================================================================
// Plugin Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin directory must be an existing local directory: {0}")]
    InvalidDirectory(PathBuf),

    #[error("Failed to scan plugin directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load plugin {path:?}: {message}")]
    Load { path: PathBuf, message: String },

    #[error("Plugin {0:?} changed after its trust check; refusing to load")]
    Changed(PathBuf),

    #[error("Step '{step_id}' declares an invalid parameter schema: {message}")]
    InvalidSchema { step_id: String, message: String },

    #[error("Plugin step '{step_id}' failed: {message}")]
    Execution { step_id: String, message: String },
}

// =============================================================================
// Station Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum StationError {
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentError),

    #[error("Parameter binding error: {0}")]
    Binding(#[from] BindError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Run cancelled")]
    Cancelled,
}

impl From<figment::Error> for StationError {
    fn from(err: figment::Error) -> Self {
        StationError::Config(Box::new(err))
    }
}

//! Structured slot logging.
//!
//! Every record the core emits about a slot run goes through a [`LogSink`] as a
//! [`LogEntry`] tagged with the slot id and the slot-run's correlation id. The
//! default sink forwards to `tracing`; [`MemorySink`] keeps entries in memory
//! for slot-local collection and tests.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// One structured log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub slot_id: u32,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] slot {} ({}) {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level,
            self.slot_id,
            self.correlation_id,
            self.message
        )
    }
}

/// Destination for structured log entries.
pub trait LogSink: Send + Sync {
    fn log(&self, entry: LogEntry);
}

/// Forwards entries to the global `tracing` dispatcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, entry: LogEntry) {
        let LogEntry {
            correlation_id,
            slot_id,
            level,
            message,
            ..
        } = entry;
        match level {
            LogLevel::Trace => tracing::trace!(slot_id, %correlation_id, "{}", message),
            LogLevel::Debug => tracing::debug!(slot_id, %correlation_id, "{}", message),
            LogLevel::Info => tracing::info!(slot_id, %correlation_id, "{}", message),
            LogLevel::Warning => tracing::warn!(slot_id, %correlation_id, "{}", message),
            LogLevel::Error | LogLevel::Critical => {
                let critical = level == LogLevel::Critical;
                tracing::error!(slot_id, %correlation_id, critical, "{}", message)
            }
        }
    }
}

/// Keeps entries in memory, optionally forwarding each one to another sink.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
    forward: Option<Arc<dyn LogSink>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect entries locally and pass them on to `inner`
    pub fn forwarding(inner: Arc<dyn LogSink>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            forward: Some(inner),
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// True if any collected message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.lock().iter().any(|e| e.message.contains(needle))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl LogSink for MemorySink {
    fn log(&self, entry: LogEntry) {
        if let Some(inner) = &self.forward {
            inner.log(entry.clone());
        }
        self.entries.lock().push(entry);
    }
}

impl fmt::Debug for MemorySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySink")
            .field("entries", &self.len())
            .field("forwarding", &self.forward.is_some())
            .finish()
    }
}

/// A sink bound to one slot-run.
#[derive(Clone)]
pub struct SlotLogger {
    sink: Arc<dyn LogSink>,
    correlation_id: Uuid,
    slot_id: u32,
}

impl SlotLogger {
    pub fn new(sink: Arc<dyn LogSink>, correlation_id: Uuid, slot_id: u32) -> Self {
        Self {
            sink,
            correlation_id,
            slot_id,
        }
    }

    /// Logger that is not tied to any slot run; entries go to `tracing`.
    pub fn detached() -> Self {
        Self::new(Arc::new(TracingSink), Uuid::nil(), 0)
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn slot_id(&self) -> u32 {
        self.slot_id
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogEntry {
            timestamp: Utc::now(),
            correlation_id: self.correlation_id,
            slot_id: self.slot_id,
            level,
            message: message.into(),
        });
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.log(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

impl fmt::Debug for SlotLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotLogger")
            .field("correlation_id", &self.correlation_id)
            .field("slot_id", &self.slot_id)
            .finish_non_exhaustive()
    }
}

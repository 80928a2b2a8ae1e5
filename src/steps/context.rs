//! Per-slot run context handed to every step.

use crate::instruments::InstrumentServices;
use crate::limits::LimitTable;
use crate::logging::SlotLogger;
use crate::results::Measurement;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Context key under which Measure stores its reading for Evaluate
pub const LAST_MEASUREMENT: &str = "LastMeasurement";

/// A value shared between steps of one slot-run
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Measurement(Measurement),
    Text(String),
}

/// Everything a step may touch while running for one slot.
///
/// The item store is the only mutable part; steps of one slot run strictly
/// in sequence, so the lock is never contended in practice.
pub struct RunContext {
    run_id: Uuid,
    slot_id: u32,
    serial_number: String,
    started_at: DateTime<Utc>,
    instruments: Arc<dyn InstrumentServices>,
    log: SlotLogger,
    limits: Arc<LimitTable>,
    items: Mutex<HashMap<String, ContextValue>>,
}

impl RunContext {
    pub fn new(
        run_id: Uuid,
        serial_number: impl Into<String>,
        instruments: Arc<dyn InstrumentServices>,
        log: SlotLogger,
        limits: Arc<LimitTable>,
    ) -> Self {
        Self {
            run_id,
            slot_id: log.slot_id(),
            serial_number: serial_number.into(),
            started_at: Utc::now(),
            instruments,
            log,
            limits,
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn correlation_id(&self) -> Uuid {
        self.log.correlation_id()
    }

    pub fn slot_id(&self) -> u32 {
        self.slot_id
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn instruments(&self) -> &dyn InstrumentServices {
        self.instruments.as_ref()
    }

    pub fn log(&self) -> &SlotLogger {
        &self.log
    }

    pub fn limits(&self) -> &LimitTable {
        &self.limits
    }

    pub fn set_item(&self, key: impl Into<String>, value: ContextValue) {
        self.items.lock().insert(key.into(), value);
    }

    pub fn item(&self, key: &str) -> Option<ContextValue> {
        self.items.lock().get(key).cloned()
    }

    pub fn set_text(&self, key: impl Into<String>, value: impl Into<String>) {
        self.set_item(key, ContextValue::Text(value.into()));
    }

    pub fn text(&self, key: &str) -> Option<String> {
        match self.item(key) {
            Some(ContextValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Text items, sorted by key. Plugins only ever see these.
    pub fn text_items(&self) -> BTreeMap<String, String> {
        self.items
            .lock()
            .iter()
            .filter_map(|(key, value)| match value {
                ContextValue::Text(text) => Some((key.clone(), text.clone())),
                ContextValue::Measurement(_) => None,
            })
            .collect()
    }

    pub fn set_last_measurement(&self, measurement: Measurement) {
        self.set_item(LAST_MEASUREMENT, ContextValue::Measurement(measurement));
    }

    pub fn last_measurement(&self) -> Option<Measurement> {
        match self.item(LAST_MEASUREMENT) {
            Some(ContextValue::Measurement(measurement)) => Some(measurement),
            _ => None,
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("slot_id", &self.slot_id)
            .field("serial_number", &self.serial_number)
            .field("correlation_id", &self.correlation_id())
            .finish_non_exhaustive()
    }
}

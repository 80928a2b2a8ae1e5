//! Measurement limits: definitions, evaluation and the CSV limit table.
//!
//! A limit table is loaded once per run and shared read-only by every slot's
//! Evaluate step. Lookup by measurement name ignores ASCII case.

use crate::error::StationResult;
use crate::results::Measurement;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// Lower/upper specification limits for one measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitDefinition {
    pub name: String,
    pub unit: String,
    pub lsl: Option<f64>,
    pub usl: Option<f64>,
    pub target: Option<f64>,
}

impl LimitDefinition {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            lsl: None,
            usl: None,
            target: None,
        }
    }

    pub fn with_bounds(mut self, lsl: Option<f64>, usl: Option<f64>) -> Self {
        self.lsl = lsl;
        self.usl = usl;
        self
    }

    pub fn with_target(mut self, target: f64) -> Self {
        self.target = Some(target);
        self
    }
}

/// Outcome of evaluating a measurement against a limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitResult {
    pub name: String,
    pub unit: String,
    pub value: f64,
    pub lsl: Option<f64>,
    pub usl: Option<f64>,
    pub target: Option<f64>,
    pub pass: bool,
    pub message: String,
}

/// Evaluate `measurement` against `limit`.
///
/// Messages: "Measurement name mismatch.", "Below LSL", "Above USL" (both
/// joined with "; " when both bounds are violated) or "OK".
pub fn evaluate(limit: &LimitDefinition, measurement: &Measurement) -> LimitResult {
    let mut violations: Vec<&str> = Vec::new();

    if !limit.name.eq_ignore_ascii_case(&measurement.name) {
        violations.push("Measurement name mismatch.");
    } else {
        if limit.lsl.is_some_and(|lsl| measurement.value < lsl) {
            violations.push("Below LSL");
        }
        if limit.usl.is_some_and(|usl| measurement.value > usl) {
            violations.push("Above USL");
        }
    }

    let pass = violations.is_empty();
    LimitResult {
        name: limit.name.clone(),
        unit: limit.unit.clone(),
        value: measurement.value,
        lsl: limit.lsl,
        usl: limit.usl,
        target: limit.target,
        pass,
        message: if pass {
            "OK".to_string()
        } else {
            violations.join("; ")
        },
    }
}

/// Read-only table of limits keyed by measurement name
#[derive(Debug, Clone, Default)]
pub struct LimitTable {
    limits: HashMap<String, LimitDefinition>,
}

impl LimitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(definitions: impl IntoIterator<Item = LimitDefinition>) -> Self {
        let mut table = Self::new();
        for definition in definitions {
            table.insert(definition);
        }
        table
    }

    pub fn insert(&mut self, definition: LimitDefinition) {
        self.limits
            .insert(definition.name.to_ascii_lowercase(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&LimitDefinition> {
        self.limits.get(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Parse a limit table: header row, then `name,unit,lsl,usl[,target]`.
    ///
    /// Rows with fewer than four columns are skipped; blank or unparsable
    /// numbers are treated as absent.
    pub fn from_csv_reader<R: Read>(reader: R) -> StationResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut table = Self::new();
        for record in csv_reader.records() {
            let record = record?;
            if record.len() < 4 {
                continue;
            }
            let number = |index: usize| record.get(index).and_then(|raw| raw.parse::<f64>().ok());
            table.insert(LimitDefinition {
                name: record.get(0).unwrap_or_default().to_string(),
                unit: record.get(1).unwrap_or_default().to_string(),
                lsl: number(2),
                usl: number(3),
                target: number(4),
            });
        }
        Ok(table)
    }

    pub fn from_csv_str(text: &str) -> StationResult<Self> {
        Self::from_csv_reader(text.as_bytes())
    }

    pub fn load(path: impl AsRef<Path>) -> StationResult<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_csv_reader(file)
    }
}

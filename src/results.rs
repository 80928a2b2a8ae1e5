//! Step, slot and run result types.
//!
//! Everything here is produced once and then only read: step results by the
//! sequence runner, slot reports and the run summary by the station
//! controller. Report writers serialize them with serde.

use crate::limits::LimitResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// Step Results
// =============================================================================

/// Outcome of one executed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepOutcome {
    Pass,
    Fail,
    Error,
    Skipped,
}

impl StepOutcome {
    pub fn is_pass(self) -> bool {
        self == StepOutcome::Pass
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepOutcome::Pass => "Pass",
            StepOutcome::Fail => "Fail",
            StepOutcome::Error => "Error",
            StepOutcome::Skipped => "Skipped",
        };
        f.write_str(label)
    }
}

/// A named, timestamped reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Result of one step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub outcome: StepOutcome,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub measurements: Vec<Measurement>,
    pub limits: Vec<LimitResult>,
    pub error: Option<String>,
}

impl StepResult {
    fn new(step_name: impl Into<String>, outcome: StepOutcome, error: Option<String>) -> Self {
        Self {
            step_name: step_name.into(),
            outcome,
            duration: Duration::ZERO,
            measurements: Vec::new(),
            limits: Vec::new(),
            error,
        }
    }

    /// Create a passing result
    pub fn pass(step_name: impl Into<String>) -> Self {
        Self::new(step_name, StepOutcome::Pass, None)
    }

    /// Create a failing result
    pub fn fail(step_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(step_name, StepOutcome::Fail, Some(message.into()))
    }

    /// Create an error result (unexpected failure inside the step)
    pub fn error(step_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(step_name, StepOutcome::Error, Some(message.into()))
    }

    pub fn skipped(step_name: impl Into<String>) -> Self {
        Self::new(step_name, StepOutcome::Skipped, None)
    }

    /// Add a measurement
    pub fn with_measurement(mut self, measurement: Measurement) -> Self {
        self.measurements.push(measurement);
        self
    }

    /// Add a limit evaluation
    pub fn with_limit(mut self, limit: LimitResult) -> Self {
        self.limits.push(limit);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn passed(&self) -> bool {
        self.outcome.is_pass()
    }
}

// =============================================================================
// Slot and Run Aggregates
// =============================================================================

/// Lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotState {
    Idle,
    Running,
    Pass,
    Fail,
    Stopped,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SlotState::Idle => "Idle",
            SlotState::Running => "Running",
            SlotState::Pass => "Pass",
            SlotState::Fail => "Fail",
            SlotState::Stopped => "Stopped",
        };
        f.write_str(label)
    }
}

/// Final record of one slot-run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotReport {
    pub slot_id: u32,
    pub serial_number: String,
    pub final_state: SlotState,
    pub steps: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_id: Uuid,
}

/// Aggregate over every slot of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub slot_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub stopped: usize,
}

impl RunSummary {
    /// Count final states across `reports`
    pub fn from_reports(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        reports: &[SlotReport],
    ) -> Self {
        let count = |state: SlotState| reports.iter().filter(|r| r.final_state == state).count();
        Self {
            run_id,
            started_at,
            finished_at,
            slot_count: reports.len(),
            passed: count(SlotState::Pass),
            failed: count(SlotState::Fail),
            stopped: count(SlotState::Stopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(slot_id: u32, final_state: SlotState) -> SlotReport {
        SlotReport {
            slot_id,
            serial_number: format!("SN{:04}", slot_id),
            final_state,
            steps: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            run_id: Uuid::nil(),
        }
    }

    #[test]
    fn summary_counts_final_states() {
        let reports = vec![
            report(1, SlotState::Pass),
            report(2, SlotState::Fail),
            report(3, SlotState::Stopped),
            report(4, SlotState::Pass),
        ];
        let summary = RunSummary::from_reports(Uuid::nil(), Utc::now(), Utc::now(), &reports);
        assert_eq!(summary.slot_count, 4);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.stopped, 1);
    }

    #[test]
    fn builders_set_outcome_and_message() {
        let result = StepResult::fail("CommUp", "CAN response invalid")
            .with_duration(Duration::from_millis(80));
        assert_eq!(result.outcome, StepOutcome::Fail);
        assert_eq!(result.error.as_deref(), Some("CAN response invalid"));
        assert!(!result.passed());
        assert!(StepResult::pass("Safety").passed());
    }
}

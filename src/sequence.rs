//! Sequence runner.
//!
//! Runs a slot's steps strictly in order. Each step moves through
//! `Pending → Running → {Pass, Fail, Error, Skipped}`; observers are told
//! about every transition.
//!
//! # Failure Policy
//!
//! - [`FailurePolicy::StopOnFail`]: the first non-pass outcome ends the
//!   sequence. Later steps are not executed and do not appear in the result.
//! - [`FailurePolicy::ContinueOnFail`]: every step runs.
//!
//! # Step Boundary
//!
//! Errors and panics escaping a step become an `Error` outcome carrying the
//! message. Cancellation is the exception: it aborts the sequence and is
//! returned as [`SequenceCancelled`] with the steps finished so far.

use crate::error::is_cancelled;
use crate::results::{StepOutcome, StepResult};
use crate::steps::{RunContext, TestStep};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// What to do after a step that did not pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    StopOnFail,
    ContinueOnFail,
}

/// Per-step execution state reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    Pending,
    Running,
    Pass,
    Fail,
    Error,
    Skipped,
}

impl From<StepOutcome> for StepState {
    fn from(outcome: StepOutcome) -> Self {
        match outcome {
            StepOutcome::Pass => StepState::Pass,
            StepOutcome::Fail => StepState::Fail,
            StepOutcome::Error => StepState::Error,
            StepOutcome::Skipped => StepState::Skipped,
        }
    }
}

/// Callback receiving `(step name, state)` transitions
pub type StepObserver = Arc<dyn Fn(&str, StepState) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceResult {
    pub steps: Vec<StepResult>,
    /// True iff every executed step passed
    pub passed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The sequence was cancelled; `partial` holds the steps that completed.
#[derive(Debug, thiserror::Error)]
#[error("Sequence cancelled after {} completed step(s)", .partial.len())]
pub struct SequenceCancelled {
    pub partial: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct SequenceRunner {
    policy: FailurePolicy,
    observer: Option<StepObserver>,
}

impl SequenceRunner {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: StepObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    fn notify(&self, step: &str, state: StepState) {
        if let Some(observer) = &self.observer {
            observer(step, state);
        }
    }

    pub async fn run(
        &self,
        steps: &[Box<dyn TestStep>],
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<SequenceResult, SequenceCancelled> {
        let started_at = Utc::now();
        let mut results = Vec::with_capacity(steps.len());

        for step in steps {
            self.notify(step.name(), StepState::Pending);
        }

        for step in steps {
            if cancel.is_cancelled() {
                return Err(SequenceCancelled {
                    partial: results,
                    started_at,
                });
            }

            self.notify(step.name(), StepState::Running);
            let Some(result) = run_step(step.as_ref(), ctx, cancel).await else {
                ctx.log()
                    .warn(format!("Step {} cancelled", step.name()));
                return Err(SequenceCancelled {
                    partial: results,
                    started_at,
                });
            };
            self.notify(step.name(), result.outcome.into());

            let stop = !result.passed() && self.policy == FailurePolicy::StopOnFail;
            results.push(result);
            if stop {
                break;
            }
        }

        let passed = results.iter().all(StepResult::passed);
        Ok(SequenceResult {
            steps: results,
            passed,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

impl std::fmt::Debug for SequenceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceRunner")
            .field("policy", &self.policy)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Execute one step. `None` means the step was cancelled.
async fn run_step(
    step: &dyn TestStep,
    ctx: &RunContext,
    cancel: &CancellationToken,
) -> Option<StepResult> {
    let name = step.name().to_string();
    let started = Instant::now();
    ctx.log().info(format!("Step {} started", name));

    let body = AssertUnwindSafe(step.execute(ctx, cancel)).catch_unwind();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        outcome = body => outcome,
    };

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if is_cancelled(&e) || cancel.is_cancelled() => return None,
        Ok(Err(e)) => {
            ctx.log().error(format!("Step {} error: {:#}", name, e));
            StepResult::error(&name, format!("{:#}", e))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            ctx.log().error(format!("Step {} panicked: {}", name, message));
            StepResult::error(&name, message)
        }
    };

    let result = result.with_duration(started.elapsed());
    ctx.log().info(format!(
        "Step {} finished: {} ({} ms)",
        name,
        result.outcome,
        result.duration.as_millis()
    ));
    Some(result)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "step panicked".to_string()
    }
}

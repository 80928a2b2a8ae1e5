//! Built-in steps.
//!
//! | id             | behaviour                                              |
//! |----------------|--------------------------------------------------------|
//! | `Safety`       | logs the safety check, passes                          |
//! | `PowerUp`      | switches the supply on at the configured setpoint      |
//! | `CommUp`       | pings the bus and checks the response prefix           |
//! | `Measure`      | reads the multimeter, stores the last measurement      |
//! | `Evaluate`     | checks the last measurement against the limit table    |
//! | `builtin.echo` | stores its message as context item `echo`              |

use crate::limits::evaluate;
use crate::results::{Measurement, StepResult};
use crate::steps::params::{
    CommUpParams, EchoParams, MeasureParams, ParamType, ParameterSchema, ParameterShape,
    PowerUpParams, StepParameters,
};
use crate::steps::registry::StepDefinition;
use crate::steps::{RunContext, TestStep};
use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub const SAFETY: &str = "Safety";
pub const POWER_UP: &str = "PowerUp";
pub const COMM_UP: &str = "CommUp";
pub const MEASURE: &str = "Measure";
pub const EVALUATE: &str = "Evaluate";
pub const ECHO: &str = "builtin.echo";

/// Context item written by the echo step
pub const ECHO_ITEM: &str = "echo";

/// Definitions for every built-in step
pub fn definitions() -> Vec<StepDefinition> {
    vec![
        StepDefinition::new(
            SAFETY,
            "Safety",
            "Setup",
            ParameterSchema::empty(),
            ParameterShape::None,
            |_| Box::new(SafetyStep),
        ),
        StepDefinition::new(
            POWER_UP,
            "PowerUp",
            "Power",
            ParameterSchema::empty()
                .property("voltage", ParamType::Number)
                .property("current_limit", ParamType::Number),
            ParameterShape::PowerUp,
            |parameters| {
                let params = match parameters {
                    StepParameters::PowerUp(params) => params,
                    _ => PowerUpParams::default(),
                };
                Box::new(PowerUpStep { params })
            },
        ),
        StepDefinition::new(
            COMM_UP,
            "CommUp",
            "Communication",
            ParameterSchema::empty()
                .property("payload", ParamType::String)
                .property("expect_prefix", ParamType::String),
            ParameterShape::CommUp,
            |parameters| {
                let params = match parameters {
                    StepParameters::CommUp(params) => params,
                    _ => CommUpParams::default(),
                };
                Box::new(CommUpStep { params })
            },
        ),
        StepDefinition::new(
            MEASURE,
            "Measure",
            "Measurement",
            ParameterSchema::empty()
                .property("name", ParamType::String)
                .property("unit", ParamType::String),
            ParameterShape::Measure,
            |parameters| {
                let params = match parameters {
                    StepParameters::Measure(params) => params,
                    _ => MeasureParams::default(),
                };
                Box::new(MeasureStep { params })
            },
        ),
        StepDefinition::new(
            EVALUATE,
            "Evaluate",
            "Evaluation",
            ParameterSchema::empty(),
            ParameterShape::None,
            |_| Box::new(EvaluateStep),
        ),
        StepDefinition::new(
            ECHO,
            "Echo",
            "Utility",
            ParameterSchema::empty().property("message", ParamType::String),
            ParameterShape::Echo,
            |parameters| {
                let params = match parameters {
                    StepParameters::Echo(params) => params,
                    _ => EchoParams::default(),
                };
                Box::new(EchoStep { params })
            },
        ),
    ]
}

// =============================================================================
// Steps
// =============================================================================

pub struct SafetyStep;

#[async_trait]
impl TestStep for SafetyStep {
    fn name(&self) -> &str {
        "Safety"
    }

    async fn execute(&self, ctx: &RunContext, _cancel: &CancellationToken) -> Result<StepResult> {
        ctx.log().info("Safety checks passed.");
        Ok(StepResult::pass(self.name()))
    }
}

pub struct PowerUpStep {
    params: PowerUpParams,
}

#[async_trait]
impl TestStep for PowerUpStep {
    fn name(&self) -> &str {
        "PowerUp"
    }

    async fn execute(&self, ctx: &RunContext, _cancel: &CancellationToken) -> Result<StepResult> {
        let PowerUpParams {
            voltage,
            current_limit,
        } = self.params;
        ctx.instruments()
            .psu()
            .set_output(true, voltage, current_limit)
            .await?;
        ctx.log().info(format!(
            "PSU output enabled at {} V, limit {} A",
            voltage, current_limit
        ));
        Ok(StepResult::pass(self.name()))
    }
}

pub struct CommUpStep {
    params: CommUpParams,
}

fn has_prefix_ignore_case(response: &str, prefix: &str) -> bool {
    response
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

#[async_trait]
impl TestStep for CommUpStep {
    fn name(&self) -> &str {
        "CommUp"
    }

    async fn execute(&self, ctx: &RunContext, _cancel: &CancellationToken) -> Result<StepResult> {
        let response = ctx.instruments().can().send(&self.params.payload).await?;
        if has_prefix_ignore_case(&response, &self.params.expect_prefix) {
            ctx.log().info(format!("CAN response: {}", response));
            Ok(StepResult::pass(self.name()))
        } else {
            ctx.log()
                .warn(format!("Unexpected CAN response: {:?}", response));
            Ok(StepResult::fail(self.name(), "CAN response invalid"))
        }
    }
}

pub struct MeasureStep {
    params: MeasureParams,
}

#[async_trait]
impl TestStep for MeasureStep {
    fn name(&self) -> &str {
        "Measure"
    }

    async fn execute(&self, ctx: &RunContext, _cancel: &CancellationToken) -> Result<StepResult> {
        let value = ctx.instruments().dmm().measure_voltage().await?;
        let measurement = Measurement::new(&self.params.name, value, &self.params.unit);
        ctx.log().info(format!(
            "Measured {} = {:.4} {}",
            measurement.name, measurement.value, measurement.unit
        ));
        ctx.set_last_measurement(measurement.clone());
        Ok(StepResult::pass(self.name()).with_measurement(measurement))
    }
}

pub struct EvaluateStep;

#[async_trait]
impl TestStep for EvaluateStep {
    fn name(&self) -> &str {
        "Evaluate"
    }

    async fn execute(&self, ctx: &RunContext, _cancel: &CancellationToken) -> Result<StepResult> {
        let Some(measurement) = ctx.last_measurement() else {
            return Ok(StepResult::fail(self.name(), "No measurement available"));
        };
        let Some(limit) = ctx.limits().get(&measurement.name) else {
            return Ok(StepResult::fail(self.name(), "No limit defined").with_measurement(measurement));
        };

        let evaluation = evaluate(limit, &measurement);
        let result = if evaluation.pass {
            StepResult::pass(self.name())
        } else {
            StepResult::fail(self.name(), evaluation.message.clone())
        };
        Ok(result.with_measurement(measurement).with_limit(evaluation))
    }
}

pub struct EchoStep {
    params: EchoParams,
}

#[async_trait]
impl TestStep for EchoStep {
    fn name(&self) -> &str {
        "Echo"
    }

    async fn execute(&self, ctx: &RunContext, _cancel: &CancellationToken) -> Result<StepResult> {
        ctx.set_text(ECHO_ITEM, self.params.message.clone());
        ctx.log().debug(format!("Echo: {}", self.params.message));
        Ok(StepResult::pass(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::{
        HealthCheckOptions, InstrumentManager, InstrumentManagerConfig, MockInstrumentOptions,
    };
    use crate::limits::{LimitDefinition, LimitTable};
    use crate::logging::SlotLogger;
    use crate::results::StepOutcome;
    use std::sync::Arc;
    use uuid::Uuid;

    fn context(limits: LimitTable) -> RunContext {
        let config = InstrumentManagerConfig {
            health: HealthCheckOptions::disabled(),
            mocks: MockInstrumentOptions::fast(),
            ..Default::default()
        };
        let manager = InstrumentManager::new(&config, SlotLogger::detached(), &CancellationToken::new());
        RunContext::new(
            Uuid::new_v4(),
            "SN0001",
            Arc::new(manager),
            SlotLogger::detached(),
            Arc::new(limits),
        )
    }

    #[test]
    fn prefix_check_ignores_case() {
        assert!(has_prefix_ignore_case("ack:PING", "ACK"));
        assert!(!has_prefix_ignore_case("NAK", "ACK"));
        assert!(!has_prefix_ignore_case("AC", "ACK"));
    }

    #[tokio::test]
    async fn measure_then_evaluate_passes_within_limits() {
        let limits = LimitTable::from_definitions([
            LimitDefinition::new("Voltage", "V").with_bounds(Some(3.0), Some(3.6))
        ]);
        let ctx = context(limits);
        let cancel = CancellationToken::new();

        let measured = MeasureStep {
            params: MeasureParams::default(),
        }
        .execute(&ctx, &cancel)
        .await
        .unwrap();
        assert_eq!(measured.outcome, StepOutcome::Pass);
        assert_eq!(measured.measurements.len(), 1);

        let evaluated = EvaluateStep.execute(&ctx, &cancel).await.unwrap();
        assert_eq!(evaluated.outcome, StepOutcome::Pass);
        assert_eq!(evaluated.limits[0].message, "OK");
    }

    #[tokio::test]
    async fn evaluate_without_measurement_or_limit_fails() {
        let ctx = context(LimitTable::new());
        let cancel = CancellationToken::new();

        let result = EvaluateStep.execute(&ctx, &cancel).await.unwrap();
        assert_eq!(result.error.as_deref(), Some("No measurement available"));

        ctx.set_last_measurement(Measurement::new("Voltage", 3.1, "V"));
        let result = EvaluateStep.execute(&ctx, &cancel).await.unwrap();
        assert_eq!(result.outcome, StepOutcome::Fail);
        assert_eq!(result.error.as_deref(), Some("No limit defined"));
        assert_eq!(result.measurements.len(), 1);
    }

    #[tokio::test]
    async fn comm_up_fails_on_unexpected_prefix() {
        let ctx = context(LimitTable::new());
        let step = CommUpStep {
            params: CommUpParams {
                payload: "PING".into(),
                expect_prefix: "NAK".into(),
            },
        };
        let result = step.execute(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.outcome, StepOutcome::Fail);
        assert_eq!(result.error.as_deref(), Some("CAN response invalid"));
    }

    #[tokio::test]
    async fn echo_writes_context_item() {
        let ctx = context(LimitTable::new());
        let step = EchoStep {
            params: EchoParams {
                message: "hello".into(),
            },
        };
        step.execute(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(ctx.text(ECHO_ITEM).as_deref(), Some("hello"));
    }
}

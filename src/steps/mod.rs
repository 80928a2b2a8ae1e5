//! Test steps: the step trait, run context, parameter binding, built-in
//! steps, plugin-provided steps and the registry that resolves them by id.
//!
//! # Lifecycle
//!
//! ```text
//! StepRegistry::discover ──► StepDefinition ──bind──► StepParameters
//!                                               │
//!                                          instantiate
//!                                               ▼
//!                                   Box<dyn TestStep>::execute(ctx)
//! ```
//!
//! Steps report expected failures (a limit violation, a bad response) as a
//! `Fail` [`StepResult`]. Anything returned as `Err` is converted to an
//! `Error` outcome by the sequence runner, except cancellation, which aborts
//! the sequence.

pub mod builtin;
pub mod context;
pub mod params;
pub mod plugin;
pub mod registry;

use crate::results::StepResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use context::{ContextValue, RunContext, LAST_MEASUREMENT};
pub use params::{ParamType, ParameterSchema, ParameterShape, StepParameters};
pub use plugin::{NativeStepLoader, PluginOptions, StepLibraryLoader, TrustedLibrary};
pub use registry::{ResolvedStep, StepDefinition, StepPlanEntry, StepRegistry};

/// One executable unit of test logic.
#[async_trait]
pub trait TestStep: Send + Sync {
    /// Display name recorded in results
    fn name(&self) -> &str;

    async fn execute(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StepResult>;
}

/// Descriptive metadata for a registered step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    /// Stable id used in step plans; matched case-insensitively
    pub step_id: String,
    pub name: String,
    pub category: String,
    pub parameters_schema: serde_json::Value,
}

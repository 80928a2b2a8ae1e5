//! Step registry.
//!
//! The registry maps stable step ids (case-insensitive) to
//! [`StepDefinition`]s. It is built once, from the built-in steps plus any
//! trusted plugin libraries, and is read-only afterwards; slots share it
//! behind an `Arc`.
//!
//! Registering a second definition under an existing id replaces the first
//! and logs a warning naming the id.
//!
//! The registry also remembers which plugin libraries it loaded, with the
//! digest each was verified against, for run manifests.

use crate::error::{BindError, PluginError};
use crate::steps::builtin;
use crate::steps::params::{self, ParameterSchema, ParameterShape, StepParameters};
use crate::steps::plugin::{
    discover_plugins, NativeStepLoader, PluginOptions, StepLibraryLoader, TrustedLibrary,
};
use crate::steps::{StepMetadata, TestStep};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a step instance from bound parameters
pub type StepFactory = Arc<dyn Fn(StepParameters) -> Box<dyn TestStep> + Send + Sync>;

/// A registered step: metadata, parameter contract and factory
#[derive(Clone)]
pub struct StepDefinition {
    metadata: StepMetadata,
    schema: ParameterSchema,
    shape: ParameterShape,
    factory: StepFactory,
}

impl StepDefinition {
    pub fn new<F>(
        step_id: &str,
        name: &str,
        category: &str,
        schema: ParameterSchema,
        shape: ParameterShape,
        factory: F,
    ) -> Self
    where
        F: Fn(StepParameters) -> Box<dyn TestStep> + Send + Sync + 'static,
    {
        Self {
            metadata: StepMetadata {
                step_id: step_id.to_string(),
                name: name.to_string(),
                category: category.to_string(),
                parameters_schema: schema.to_value(),
            },
            schema,
            shape,
            factory: Arc::new(factory),
        }
    }

    pub fn metadata(&self) -> &StepMetadata {
        &self.metadata
    }

    pub fn step_id(&self) -> &str {
        &self.metadata.step_id
    }

    pub fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    pub fn shape(&self) -> ParameterShape {
        self.shape
    }

    /// Validate and decode a parameter payload for this step
    pub fn bind(&self, payload: Option<&Value>) -> Result<StepParameters, BindError> {
        params::bind(self.step_id(), &self.schema, self.shape, payload)
    }

    pub fn instantiate(&self, parameters: StepParameters) -> Box<dyn TestStep> {
        (self.factory)(parameters)
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("metadata", &self.metadata)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

/// One entry of a station step plan: a bare id or an id with parameters.
///
/// The table form accepts only `step` and `parameters`; any other key is an
/// error so a misspelt `parameters` table is never silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StepPlanEntry {
    Id(String),
    Configured {
        step: String,
        parameters: Option<Value>,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfiguredEntry {
    step: String,
    #[serde(default)]
    parameters: Option<Value>,
}

impl<'de> Deserialize<'de> for StepPlanEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(id) => Ok(StepPlanEntry::Id(id)),
            table @ Value::Object(_) => {
                let entry: ConfiguredEntry =
                    serde_json::from_value(table).map_err(serde::de::Error::custom)?;
                Ok(StepPlanEntry::Configured {
                    step: entry.step,
                    parameters: entry.parameters,
                })
            }
            other => Err(serde::de::Error::custom(format!(
                "step plan entry must be a step id or a {{ step, parameters }} table, found {}",
                other
            ))),
        }
    }
}

impl StepPlanEntry {
    pub fn step_id(&self) -> &str {
        match self {
            StepPlanEntry::Id(id) => id,
            StepPlanEntry::Configured { step, .. } => step,
        }
    }

    pub fn parameters(&self) -> Option<&Value> {
        match self {
            StepPlanEntry::Id(_) => None,
            StepPlanEntry::Configured { parameters, .. } => parameters.as_ref(),
        }
    }
}

impl From<&str> for StepPlanEntry {
    fn from(id: &str) -> Self {
        StepPlanEntry::Id(id.to_string())
    }
}

/// A plan entry matched to its definition; parameters are not bound yet
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub definition: StepDefinition,
    pub parameters: Option<Value>,
}

impl ResolvedStep {
    /// Bind the entry's parameters and build the step
    pub fn instantiate(&self) -> Result<Box<dyn TestStep>, BindError> {
        let bound = self.definition.bind(self.parameters.as_ref())?;
        Ok(self.definition.instantiate(bound))
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    definitions: HashMap<String, StepDefinition>,
    /// Plugin libraries whose steps were registered, in load order
    plugins: Vec<TrustedLibrary>,
}

impl StepRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the built-in steps
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for definition in builtin::definitions() {
            registry.register(definition);
        }
        registry
    }

    /// Built-in steps plus every trusted library under the plugin directory
    pub fn discover(options: &PluginOptions) -> Result<Self, PluginError> {
        Self::discover_with(options, &NativeStepLoader)
    }

    pub fn discover_with(
        options: &PluginOptions,
        loader: &dyn StepLibraryLoader,
    ) -> Result<Self, PluginError> {
        let mut registry = Self::builtin();
        for (library, definitions) in discover_plugins(options, loader)? {
            for definition in definitions {
                registry.register(definition);
            }
            registry.plugins.push(library);
        }
        tracing::info!(steps = registry.len(), "Step registry ready");
        Ok(registry)
    }

    /// Register a definition, returning the one it replaced
    pub fn register(&mut self, definition: StepDefinition) -> Option<StepDefinition> {
        let key = definition.step_id().to_ascii_lowercase();
        let replaced = self.definitions.insert(key, definition);
        if let Some(previous) = &replaced {
            tracing::warn!(
                step_id = previous.step_id(),
                "Step id registered twice; the later definition replaces the earlier one"
            );
        }
        replaced
    }

    /// Libraries that were verified and loaded during discovery
    pub fn plugin_libraries(&self) -> &[TrustedLibrary] {
        &self.plugins
    }

    pub fn get(&self, step_id: &str) -> Option<&StepDefinition> {
        self.definitions.get(&step_id.to_ascii_lowercase())
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.get(step_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Declared step ids, sorted
    pub fn step_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .definitions
            .values()
            .map(|d| d.step_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Metadata of every registered step, sorted by id
    pub fn metadata(&self) -> Vec<StepMetadata> {
        let mut metadata: Vec<StepMetadata> =
            self.definitions.values().map(|d| d.metadata().clone()).collect();
        metadata.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        metadata
    }

    pub fn bind_parameters(
        &self,
        step_id: &str,
        payload: Option<&Value>,
    ) -> Result<StepParameters, BindError> {
        self.get(step_id)
            .ok_or_else(|| BindError::UnknownStep(step_id.to_string()))?
            .bind(payload)
    }

    /// Bind parameters and build a step instance
    pub fn instantiate(
        &self,
        step_id: &str,
        payload: Option<&Value>,
    ) -> Result<Box<dyn TestStep>, BindError> {
        let definition = self
            .get(step_id)
            .ok_or_else(|| BindError::UnknownStep(step_id.to_string()))?;
        let bound = definition.bind(payload)?;
        Ok(definition.instantiate(bound))
    }

    /// Match plan entries to definitions in order. Entries naming an unknown
    /// step are dropped with a warning.
    pub fn resolve_plan(&self, plan: &[StepPlanEntry]) -> Vec<ResolvedStep> {
        plan.iter()
            .filter_map(|entry| match self.get(entry.step_id()) {
                Some(definition) => Some(ResolvedStep {
                    definition: definition.clone(),
                    parameters: entry.parameters().cloned(),
                }),
                None => {
                    tracing::warn!(
                        step_id = entry.step_id(),
                        "Step plan entry does not match any registered step; skipping"
                    );
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::StepResult;
    use crate::steps::RunContext;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Replacement;

    #[async_trait]
    impl TestStep for Replacement {
        fn name(&self) -> &str {
            "Replacement"
        }

        async fn execute(
            &self,
            _ctx: &RunContext,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<StepResult> {
            Ok(StepResult::pass(self.name()))
        }
    }

    #[test]
    fn builtin_ids_are_sorted_and_case_insensitive() {
        let registry = StepRegistry::builtin();
        assert_eq!(
            registry.step_ids(),
            vec!["CommUp", "Evaluate", "Measure", "PowerUp", "Safety", "builtin.echo"]
        );
        assert!(registry.contains("powerup"));
        assert!(registry.contains("BUILTIN.ECHO"));
    }

    #[test]
    fn later_registration_wins() {
        let mut registry = StepRegistry::builtin();
        let replaced = registry.register(StepDefinition::new(
            "safety",
            "Replacement",
            "Test",
            ParameterSchema::empty(),
            ParameterShape::None,
            |_| Box::new(Replacement),
        ));
        assert!(replaced.is_some());
        let step = registry.instantiate("Safety", None).unwrap();
        assert_eq!(step.name(), "Replacement");
    }

    #[test]
    fn plan_drops_unknown_entries() {
        let registry = StepRegistry::builtin();
        let plan = vec![
            StepPlanEntry::from("Safety"),
            StepPlanEntry::from("Calibrate"),
            StepPlanEntry::Configured {
                step: "PowerUp".into(),
                parameters: Some(json!({ "voltage": 5.0 })),
            },
        ];
        let resolved = registry.resolve_plan(&plan);
        let ids: Vec<&str> = resolved.iter().map(|r| r.definition.step_id()).collect();
        assert_eq!(ids, vec!["Safety", "PowerUp"]);
        assert!(resolved[1].instantiate().is_ok());
    }

    #[test]
    fn binding_errors_are_distinct() {
        let registry = StepRegistry::builtin();
        assert_eq!(
            registry.bind_parameters("Nope", None).unwrap_err(),
            BindError::UnknownStep("Nope".into())
        );
        let err = registry
            .bind_parameters("CommUp", Some(&json!({ "payload": 7 })))
            .unwrap_err();
        assert!(matches!(err, BindError::TypeMismatch { .. }));
    }

    #[test]
    fn plan_entries_deserialize_from_both_forms() {
        let plan: Vec<StepPlanEntry> = serde_json::from_value(json!([
            "Safety",
            { "step": "builtin.echo", "parameters": { "message": "hi" } }
        ]))
        .unwrap();
        assert_eq!(plan[0].step_id(), "Safety");
        assert_eq!(plan[1].parameters(), Some(&json!({ "message": "hi" })));
    }

    #[test]
    fn plan_entry_with_unknown_key_is_rejected() {
        let err = serde_json::from_value::<StepPlanEntry>(json!({
            "step": "PowerUp",
            "params": { "voltage": 99.0 }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("params"), "{}", err);

        assert!(serde_json::from_value::<StepPlanEntry>(json!(7)).is_err());
        assert!(serde_json::from_value::<StepPlanEntry>(json!({ "parameters": {} })).is_err());
    }
}

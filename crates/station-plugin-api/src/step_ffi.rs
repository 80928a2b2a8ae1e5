//! FFI-safe step descriptors and execution payloads.

use abi_stable::std_types::{RHashMap, ROption, RString};
use abi_stable::StableAbi;
use serde::{Deserialize, Serialize};

/// FFI-safe key/value items exchanged with a step (context state in, outputs back)
pub type FfiStepItems = RHashMap<RString, RString>;

/// FFI-safe description of one step a plugin provides
#[repr(C)]
#[derive(Debug, Clone, StableAbi)]
pub struct FfiStepInfo {
    /// Stable step id (e.g., "sample.greeting")
    pub step_id: RString,
    /// Display name
    pub name: RString,
    /// Free-form category used for grouping in listings
    pub category: RString,
    /// JSON schema (object subset) describing the accepted parameters
    pub parameters_schema: RString,
}

impl FfiStepInfo {
    /// Build a step descriptor
    pub fn new(step_id: &str, name: &str, category: &str, parameters_schema: &str) -> Self {
        Self {
            step_id: RString::from(step_id),
            name: RString::from(name),
            category: RString::from(category),
            parameters_schema: RString::from(parameters_schema),
        }
    }
}

/// Slot-side context handed to a plugin step
#[repr(C)]
#[derive(Debug, Clone, StableAbi)]
pub struct FfiStepContext {
    pub slot_id: u32,
    pub serial: RString,
    pub items: FfiStepItems,
}

/// Result of a plugin step execution
#[repr(C)]
#[derive(Debug, Clone, StableAbi)]
pub struct FfiStepOutput {
    pub passed: bool,
    pub message: ROption<RString>,
    /// Items merged back into the slot's run context
    pub items: FfiStepItems,
}

impl FfiStepOutput {
    /// Passing output with no message
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: ROption::RNone,
            items: RHashMap::new(),
        }
    }

    /// Failing output carrying a message
    pub fn fail(message: &str) -> Self {
        Self {
            passed: false,
            message: ROption::RSome(RString::from(message)),
            items: RHashMap::new(),
        }
    }

    /// Builder method to add an output item
    pub fn with_item(mut self, key: &str, value: &str) -> Self {
        self.items.insert(RString::from(key), RString::from(value));
        self
    }
}

/// Host-side owned copy of [`FfiStepInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub step_id: String,
    pub name: String,
    pub category: String,
    pub parameters_schema: String,
}

impl StepDescriptor {
    /// Parse the parameter schema text as JSON
    pub fn schema_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.parameters_schema)
    }
}

impl From<&FfiStepInfo> for StepDescriptor {
    fn from(info: &FfiStepInfo) -> Self {
        Self {
            step_id: info.step_id.to_string(),
            name: info.name.to_string(),
            category: info.category.to_string(),
            parameters_schema: info.parameters_schema.to_string(),
        }
    }
}

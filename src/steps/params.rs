//! Step parameter schemas and typed parameter shapes.
//!
//! Every step declares a small JSON-schema subset: an object whose
//! `properties` each name one of `string`, `number`, `integer` or `boolean`,
//! plus an optional `required` list. Binding a payload happens in two passes:
//!
//! 1. [`ParameterSchema::validate`] rejects non-objects, unknown fields,
//!    missing required fields and type mismatches.
//! 2. [`ParameterShape::decode`] deserializes the payload into the step's
//!    [`StepParameters`] variant (serde, `deny_unknown_fields`).
//!
//! An absent or `null` payload skips both passes and yields the shape's
//! defaults.

use crate::error::BindError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// =============================================================================
// Schema
// =============================================================================

/// Primitive parameter types understood by the schema subset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
}

impl ParamType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "string" => Some(ParamType::String),
            "number" => Some(ParamType::Number),
            "integer" => Some(ParamType::Integer),
            "boolean" => Some(ParamType::Boolean),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared parameter schema of one step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSchema {
    properties: BTreeMap<String, ParamType>,
    required: BTreeSet<String>,
}

impl ParameterSchema {
    /// Schema accepting only an empty object
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add an optional property
    pub fn property(mut self, name: &str, kind: ParamType) -> Self {
        self.properties.insert(name.to_string(), kind);
        self
    }

    /// Add a required property
    pub fn required(mut self, name: &str, kind: ParamType) -> Self {
        self.properties.insert(name.to_string(), kind);
        self.required.insert(name.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Parse a schema document. Property types outside the subset and
    /// `required` entries naming undeclared properties are rejected.
    pub fn from_value(schema: &Value) -> Result<Self, String> {
        let object = schema
            .as_object()
            .ok_or_else(|| "schema must be a JSON object".to_string())?;

        if let Some(kind) = object.get("type") {
            if kind.as_str() != Some("object") {
                return Err(format!("schema type must be \"object\", got {}", kind));
            }
        }

        let mut parsed = Self::empty();
        if let Some(properties) = object.get("properties") {
            let properties = properties
                .as_object()
                .ok_or_else(|| "\"properties\" must be an object".to_string())?;
            for (name, declaration) in properties {
                let raw = declaration
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| format!("property '{}' has no type", name))?;
                let kind = ParamType::parse(raw)
                    .ok_or_else(|| format!("property '{}' has unsupported type '{}'", name, raw))?;
                parsed.properties.insert(name.clone(), kind);
            }
        }

        if let Some(required) = object.get("required") {
            let required = required
                .as_array()
                .ok_or_else(|| "\"required\" must be an array".to_string())?;
            for entry in required {
                let name = entry
                    .as_str()
                    .ok_or_else(|| "\"required\" entries must be strings".to_string())?;
                if !parsed.properties.contains_key(name) {
                    return Err(format!("required property '{}' is not declared", name));
                }
                parsed.required.insert(name.to_string());
            }
        }

        Ok(parsed)
    }

    /// Render the schema back to its JSON form
    pub fn to_value(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, kind)| (name.clone(), json!({ "type": kind.as_str() })))
            .collect();
        let mut schema = json!({ "type": "object", "properties": properties });
        if !self.required.is_empty() {
            schema["required"] = json!(self.required);
        }
        schema
    }

    /// Check `payload` against the schema. `null` is accepted for optional
    /// properties.
    pub fn validate(&self, step: &str, payload: &Value) -> Result<(), BindError> {
        let object = payload.as_object().ok_or_else(|| BindError::NotAnObject {
            step: step.to_string(),
        })?;

        for (field, value) in object {
            let kind = self
                .properties
                .get(field)
                .ok_or_else(|| BindError::UnknownField {
                    step: step.to_string(),
                    field: field.clone(),
                })?;
            let optional_null = value.is_null() && !self.required.contains(field);
            if !optional_null && !kind.matches(value) {
                return Err(BindError::TypeMismatch {
                    step: step.to_string(),
                    field: field.clone(),
                    expected: kind.to_string(),
                });
            }
        }

        if let Some(missing) = self.required.iter().find(|f| !object.contains_key(*f)) {
            return Err(BindError::MissingField {
                step: step.to_string(),
                field: missing.clone(),
            });
        }

        Ok(())
    }
}

// =============================================================================
// Typed Shapes
// =============================================================================

fn default_voltage() -> f64 {
    3.3
}

fn default_current_limit() -> f64 {
    1.0
}

fn default_payload() -> String {
    "PING".to_string()
}

fn default_expect_prefix() -> String {
    "ACK".to_string()
}

fn default_measurement_name() -> String {
    "Voltage".to_string()
}

fn default_measurement_unit() -> String {
    "V".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerUpParams {
    #[serde(default = "default_voltage")]
    pub voltage: f64,
    #[serde(default = "default_current_limit")]
    pub current_limit: f64,
}

impl Default for PowerUpParams {
    fn default() -> Self {
        Self {
            voltage: default_voltage(),
            current_limit: default_current_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommUpParams {
    #[serde(default = "default_payload")]
    pub payload: String,
    #[serde(default = "default_expect_prefix")]
    pub expect_prefix: String,
}

impl Default for CommUpParams {
    fn default() -> Self {
        Self {
            payload: default_payload(),
            expect_prefix: default_expect_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasureParams {
    #[serde(default = "default_measurement_name")]
    pub name: String,
    #[serde(default = "default_measurement_unit")]
    pub unit: String,
}

impl Default for MeasureParams {
    fn default() -> Self {
        Self {
            name: default_measurement_name(),
            unit: default_measurement_unit(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EchoParams {
    #[serde(default)]
    pub message: String,
}

/// Bound parameters, one variant per supported shape
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", content = "value")]
pub enum StepParameters {
    None,
    PowerUp(PowerUpParams),
    CommUp(CommUpParams),
    Measure(MeasureParams),
    Echo(EchoParams),
    /// Plugin steps receive the validated object as-is
    Plugin(Map<String, Value>),
}

/// Which [`StepParameters`] variant a step binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterShape {
    None,
    PowerUp,
    CommUp,
    Measure,
    Echo,
    Plugin,
}

impl ParameterShape {
    pub fn default_parameters(self) -> StepParameters {
        match self {
            ParameterShape::None => StepParameters::None,
            ParameterShape::PowerUp => StepParameters::PowerUp(PowerUpParams::default()),
            ParameterShape::CommUp => StepParameters::CommUp(CommUpParams::default()),
            ParameterShape::Measure => StepParameters::Measure(MeasureParams::default()),
            ParameterShape::Echo => StepParameters::Echo(EchoParams::default()),
            ParameterShape::Plugin => StepParameters::Plugin(Map::new()),
        }
    }

    /// Decode an already-validated payload into this shape.
    pub fn decode(self, step: &str, payload: &Value) -> Result<StepParameters, BindError> {
        let parameters = match self {
            ParameterShape::None => {
                decode::<Map<String, Value>>(step, payload)?;
                StepParameters::None
            }
            ParameterShape::PowerUp => StepParameters::PowerUp(decode(step, payload)?),
            ParameterShape::CommUp => StepParameters::CommUp(decode(step, payload)?),
            ParameterShape::Measure => StepParameters::Measure(decode(step, payload)?),
            ParameterShape::Echo => StepParameters::Echo(decode(step, payload)?),
            ParameterShape::Plugin => StepParameters::Plugin(decode(step, payload)?),
        };
        Ok(parameters)
    }
}

fn decode<T: DeserializeOwned>(step: &str, payload: &Value) -> Result<T, BindError> {
    // Optional properties given as null fall back to their defaults
    let stripped = match payload {
        Value::Object(object) => Value::Object(
            object
                .iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    };
    serde_json::from_value(stripped).map_err(|e| BindError::Decode {
        step: step.to_string(),
        message: e.to_string(),
    })
}

/// Validate and decode `payload` for `step`.
pub fn bind(
    step: &str,
    schema: &ParameterSchema,
    shape: ParameterShape,
    payload: Option<&Value>,
) -> Result<StepParameters, BindError> {
    match payload {
        None | Some(Value::Null) => Ok(shape.default_parameters()),
        Some(payload) => {
            schema.validate(step, payload)?;
            shape.decode(step, payload)
        }
    }
}

//! Example plugin demonstrating the station-plugin-api.
//!
//! Provides the `sample.greeting` step, which writes a greeting for the
//! configured name into the slot's context items.

use station_plugin_api::prelude::*;

const GREETING_STEP: &str = "sample.greeting";

// =============================================================================
// Plugin Entry Point
// =============================================================================

/// Export the plugin root module.
#[abi_stable::export_root_module]
fn get_root_module() -> StepPluginMod_Ref {
    StepPluginMod {
        abi_version,
        get_metadata,
        list_steps,
        execute_step,
    }
    .leak_into_prefix()
}

#[abi_stable::sabi_extern_fn]
fn abi_version() -> AbiVersion {
    AbiVersion::CURRENT
}

#[abi_stable::sabi_extern_fn]
fn get_metadata() -> PluginMetadata {
    PluginMetadata::new("sample", "Sample Steps", "0.1.0").with_publisher("Station Team")
}

#[abi_stable::sabi_extern_fn]
fn list_steps() -> RVec<FfiStepInfo> {
    let mut steps = RVec::new();
    steps.push(FfiStepInfo::new(
        GREETING_STEP,
        "Greeting",
        "Samples",
        r#"{"type":"object","properties":{"name":{"type":"string"}}}"#,
    ));
    steps
}

#[abi_stable::sabi_extern_fn]
fn execute_step(
    step_id: RString,
    params_json: RString,
    _ctx: FfiStepContext,
) -> RResult<FfiStepOutput, RString> {
    match step_id.as_str() {
        GREETING_STEP => match greeting(params_json.as_str()) {
            Ok(text) => RResult::ROk(FfiStepOutput::pass().with_item("greeting", &text)),
            Err(e) => RResult::RErr(RString::from(e)),
        },
        _ => RResult::RErr(RString::from(format!("Unknown step: {}", step_id))),
    }
}

// =============================================================================
// Greeting Step
// =============================================================================

fn greeting(params_json: &str) -> Result<String, String> {
    let params: serde_json::Value = if params_json.trim().is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(params_json).map_err(|e| format!("Invalid parameters: {}", e))?
    };
    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    Ok(format!("Hello, {}!", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greets_by_name() {
        assert_eq!(greeting(r#"{"name":"Ada"}"#).unwrap(), "Hello, Ada!");
    }

    #[test]
    fn empty_parameters_greet_nobody() {
        assert_eq!(greeting("").unwrap(), "Hello, !");
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(greeting("{not json").is_err());
    }
}

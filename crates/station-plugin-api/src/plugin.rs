//! Plugin root module and entry point definitions.
//!
//! Plugins export a root module via `get_root_module()` that provides
//! metadata, the list of steps, and the step execution entry point.

#![allow(non_camel_case_types)] // abi_stable generates `*_Ref` types
#![allow(clippy::expl_impl_clone_on_copy)] // StableAbi macro generates Clone impl for Copy type

use crate::metadata::{AbiVersion, PluginMetadata};
use crate::step_ffi::{FfiStepContext, FfiStepInfo, FfiStepOutput};
use abi_stable::library::RootModule;
use abi_stable::package_version_strings;
use abi_stable::sabi_types::VersionStrings;
use abi_stable::std_types::{RResult, RString, RVec};
use abi_stable::{declare_root_module_statics, StableAbi};

/// The root module that step plugins export.
///
/// # Example
///
/// ```rust,ignore
/// use station_plugin_api::prelude::*;
///
/// #[export_root_module]
/// fn get_root_module() -> StepPluginMod_Ref {
///     StepPluginMod {
///         abi_version,
///         get_metadata,
///         list_steps,
///         execute_step,
///     }
///     .leak_into_prefix()
/// }
/// ```
#[repr(C)]
#[derive(StableAbi)]
#[sabi(kind(Prefix(prefix_ref = StepPluginMod_Ref)))]
#[sabi(missing_field(panic))]
pub struct StepPluginMod {
    /// Get the ABI version this plugin was compiled with
    pub abi_version: extern "C" fn() -> AbiVersion,

    /// Get plugin metadata
    pub get_metadata: extern "C" fn() -> PluginMetadata,

    /// List the steps provided by this plugin
    #[sabi(last_prefix_field)]
    pub list_steps: extern "C" fn() -> RVec<FfiStepInfo>,

    /// Execute a step by id with JSON-encoded parameters
    ///
    /// Returns the step output, or an error message that the host reports
    /// as a step error.
    pub execute_step: extern "C" fn(
        step_id: RString,
        params_json: RString,
        ctx: FfiStepContext,
    ) -> RResult<FfiStepOutput, RString>,
}

impl RootModule for StepPluginMod_Ref {
    declare_root_module_statics! {StepPluginMod_Ref}

    const BASE_NAME: &'static str = "station_step_plugin";
    const NAME: &'static str = "station_step_plugin";
    const VERSION_STRINGS: VersionStrings = package_version_strings!();
}

impl StepPluginMod_Ref {
    /// Check if this plugin's ABI is compatible with the host
    pub fn is_compatible(&self) -> bool {
        let plugin_version = self.abi_version()();
        plugin_version.is_compatible_with(&AbiVersion::CURRENT)
    }
}

/// Error type for plugin loading
#[derive(Debug, Clone)]
pub enum PluginLoadError {
    /// The library file could not be loaded
    LoadFailed(String),
    /// The plugin's ABI version is incompatible
    IncompatibleAbi {
        plugin_version: AbiVersion,
        host_version: AbiVersion,
    },
}

impl std::fmt::Display for PluginLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoadFailed(msg) => write!(f, "Failed to load plugin library: {}", msg),
            Self::IncompatibleAbi {
                plugin_version,
                host_version,
            } => write!(
                f,
                "Plugin ABI version {} is incompatible with host version {}",
                plugin_version, host_version
            ),
        }
    }
}

impl std::error::Error for PluginLoadError {}

//! FFI-stable plugin API for rust-station test steps.
//!
#![allow(unsafe_code)] // Plugin API uses unsafe for FFI - intentional
//! This crate provides the ABI-stable interface for native step plugins using `abi_stable`.
//! A plugin exports a root module via `get_root_module()` listing the steps it provides
//! and a single `execute_step` entry point the host calls with JSON parameters.
//!
//! The host never loads a library through this crate before its own trust gate
//! (publisher seal or allow-listed SHA-256) has accepted the file.
//!
//! # Creating a Plugin
//!
//! ```rust,ignore
//! use station_plugin_api::prelude::*;
//!
//! #[export_root_module]
//! fn get_root_module() -> StepPluginMod_Ref {
//!     StepPluginMod { ... }.leak_into_prefix()
//! }
//! ```

pub mod loader;
pub mod metadata;
pub mod plugin;
pub mod step_ffi;

pub use loader::*;
pub use metadata::*;
pub use plugin::*;
pub use step_ffi::*;

/// Prelude for plugin authors
pub mod prelude {
    pub use crate::metadata::{AbiVersion, PluginMetadata};
    pub use crate::plugin::{PluginLoadError, StepPluginMod, StepPluginMod_Ref};
    pub use crate::step_ffi::{FfiStepContext, FfiStepInfo, FfiStepItems, FfiStepOutput};
    pub use abi_stable::export_root_module;
    pub use abi_stable::library::RootModule;
    pub use abi_stable::prefix_type::PrefixTypeTrait;
    pub use abi_stable::sabi_extern_fn;
    pub use abi_stable::std_types::{RHashMap, ROption, RResult, RStr, RString, RVec};
    pub use abi_stable::StableAbi;
}

/// Re-export abi_stable for plugin convenience
pub use abi_stable;

//! Library loading using abi_stable.
//!
//! Loading is the last step of discovery: callers hand a path here only after
//! the file has passed the host's trust gate.

use crate::metadata::{AbiVersion, PluginMetadata};
use crate::plugin::{PluginLoadError, StepPluginMod_Ref};
use crate::step_ffi::{FfiStepContext, FfiStepOutput, StepDescriptor};
use abi_stable::library::lib_header_from_path;
use abi_stable::std_types::{RResult, RString};
use std::path::{Path, PathBuf};

/// A loaded step library
#[derive(Clone)]
pub struct LoadedStepLibrary {
    /// Plugin metadata
    pub metadata: PluginMetadata,
    /// The plugin's root module reference
    plugin_ref: StepPluginMod_Ref,
    /// Path to the loaded library
    pub path: PathBuf,
}

impl LoadedStepLibrary {
    /// Load a library from a specific path and verify its ABI version.
    ///
    /// The library stays mapped for the rest of the process.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PluginLoadError> {
        let path = path.as_ref();

        let header = lib_header_from_path(path).map_err(|e| {
            PluginLoadError::LoadFailed(format!("Failed to load library header: {}", e))
        })?;

        let plugin_ref = header
            .init_root_module::<StepPluginMod_Ref>()
            .map_err(|e| {
                PluginLoadError::LoadFailed(format!("Failed to init root module: {}", e))
            })?;

        let plugin_abi = plugin_ref.abi_version()();
        if !plugin_abi.is_compatible_with(&AbiVersion::CURRENT) {
            return Err(PluginLoadError::IncompatibleAbi {
                plugin_version: plugin_abi,
                host_version: AbiVersion::CURRENT,
            });
        }

        let metadata = plugin_ref.get_metadata()();
        tracing::info!(
            plugin_id = %metadata.plugin_id,
            version = %metadata.version,
            "Loaded step plugin from {:?}",
            path
        );

        Ok(Self {
            metadata,
            plugin_ref,
            path: path.to_path_buf(),
        })
    }

    /// Steps provided by this library
    pub fn steps(&self) -> Vec<StepDescriptor> {
        self.plugin_ref
            .list_steps()()
            .iter()
            .map(StepDescriptor::from)
            .collect()
    }

    /// Execute a step by id
    pub fn execute(
        &self,
        step_id: &str,
        params_json: &str,
        ctx: FfiStepContext,
    ) -> Result<FfiStepOutput, String> {
        let result = self.plugin_ref.execute_step()(
            RString::from(step_id),
            RString::from(params_json),
            ctx,
        );
        match result {
            RResult::ROk(output) => Ok(output),
            RResult::RErr(err) => Err(err.to_string()),
        }
    }
}

impl std::fmt::Debug for LoadedStepLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedStepLibrary")
            .field("metadata", &self.metadata)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Check if a path carries the platform's dynamic library extension
pub fn is_plugin_library(path: &Path) -> bool {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    #[cfg(target_os = "macos")]
    {
        extension == "dylib"
    }
    #[cfg(target_os = "linux")]
    {
        extension == "so"
    }
    #[cfg(target_os = "windows")]
    {
        extension.eq_ignore_ascii_case("dll")
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        let _ = extension;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_fails_to_load() {
        let err = LoadedStepLibrary::load("/nonexistent/libnothing.so").unwrap_err();
        assert!(matches!(err, PluginLoadError::LoadFailed(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn recognizes_shared_objects() {
        assert!(is_plugin_library(Path::new("/plugins/libsample.so")));
        assert!(!is_plugin_library(Path::new("/plugins/libsample.so.sha256")));
        assert!(!is_plugin_library(Path::new("/plugins/readme.txt")));
    }
}

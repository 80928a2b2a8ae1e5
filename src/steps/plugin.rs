//! Plugin discovery and the trust gate.
//!
//! A plugin is a native step library in the configured plugin directory.
//! Discovery never loads a file it does not trust. A library is trusted when
//! either:
//!
//! - a publisher seal sits next to it (`<file>.publisher.json`, holding
//!   `{ "publisher", "sha256" }`) naming a trusted publisher and matching
//!   the library's SHA-256, or
//! - its SHA-256 appears in the allow-list (hex, case-insensitive).
//!
//! Untrusted libraries are skipped with a debug trace and nothing else.
//! Trusted libraries that fail to load are skipped with a warning. A trusted
//! library is loaded from a private copy of the bytes that passed the check.
//!
//! # Directory Rules
//!
//! Only regular files directly inside the directory that carry the platform
//! library extension are candidates. Each is canonicalized and must still
//! resolve inside the directory. Candidates are processed in sorted order so
//! the "last registered wins" collision rule is deterministic.

use crate::error::{InstrumentError, PluginError};
use crate::manifest::content_hash;
use crate::results::StepResult;
use crate::steps::params::{ParameterSchema, ParameterShape, StepParameters};
use crate::steps::registry::StepDefinition;
use crate::steps::{RunContext, TestStep};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use station_plugin_api::abi_stable::std_types::{RHashMap, RString};
use station_plugin_api::{is_plugin_library, FfiStepContext, LoadedStepLibrary, StepDescriptor};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// File name suffix of a publisher seal
pub const SEAL_SUFFIX: &str = ".publisher.json";

/// Plugin directory and trust configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginOptions {
    /// Directory scanned for step libraries; no plugins when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// SHA-256 digests of libraries trusted without a seal
    #[serde(default)]
    pub allowed_sha256: Vec<String>,
    /// Publishers whose seals are honoured
    #[serde(default)]
    pub trusted_publishers: Vec<String>,
}

impl PluginOptions {
    pub fn in_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
            ..Self::default()
        }
    }

    pub fn allow_sha256(mut self, digest: impl Into<String>) -> Self {
        self.allowed_sha256.push(digest.into());
        self
    }

    pub fn trust_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.trusted_publishers.push(publisher.into());
        self
    }
}

/// Sidecar identity marker written next to a signed library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherSeal {
    pub publisher: String,
    pub sha256: String,
}

/// Path of the seal belonging to `library`
pub fn seal_path(library: &Path) -> PathBuf {
    let mut name = library.file_name().unwrap_or_default().to_os_string();
    name.push(SEAL_SUFFIX);
    library.with_file_name(name)
}

/// Why a library was accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trust {
    Publisher(String),
    AllowListed,
}

/// Decide whether `library` (with content `bytes`) may be loaded.
pub fn verify_trust(options: &PluginOptions, library: &Path, bytes: &[u8]) -> Option<Trust> {
    let digest = content_hash(bytes);

    if let Some(seal) = read_seal(library) {
        let trusted = options
            .trusted_publishers
            .iter()
            .any(|p| p == &seal.publisher);
        if trusted && seal.sha256.eq_ignore_ascii_case(&digest) {
            return Some(Trust::Publisher(seal.publisher));
        }
    }

    options
        .allowed_sha256
        .iter()
        .any(|allowed| allowed.trim().eq_ignore_ascii_case(&digest))
        .then_some(Trust::AllowListed)
}

fn read_seal(library: &Path) -> Option<PublisherSeal> {
    let raw = fs::read_to_string(seal_path(library)).ok()?;
    match serde_json::from_str(&raw) {
        Ok(seal) => Some(seal),
        Err(e) => {
            tracing::debug!("Ignoring malformed publisher seal for {:?}: {}", library, e);
            None
        }
    }
}

/// Candidate library files under `directory`, canonicalized and sorted.
///
/// A missing directory yields no candidates; a path that exists but is not
/// a directory is an error. Entries that cannot be inspected are skipped
/// with a warning.
pub fn candidate_libraries(directory: &Path) -> Result<Vec<PathBuf>, PluginError> {
    if !directory.exists() {
        tracing::debug!("Plugin directory {:?} does not exist", directory);
        return Ok(Vec::new());
    }
    if !directory.is_dir() {
        return Err(PluginError::InvalidDirectory(directory.to_path_buf()));
    }

    let root = directory.canonicalize()?;
    let mut candidates = Vec::new();
    for entry in fs::read_dir(&root)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry in {:?}: {}", root, e);
                continue;
            }
        };
        let is_file = match entry.file_type() {
            Ok(file_type) => file_type.is_file(),
            Err(e) => {
                tracing::warn!("Skipping {:?}: {}", entry.path(), e);
                continue;
            }
        };
        if !is_file || !is_plugin_library(&entry.path()) {
            continue;
        }
        let path = match entry.path().canonicalize() {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Skipping {:?}: {}", entry.path(), e);
                continue;
            }
        };
        if !path.starts_with(&root) {
            tracing::debug!("Skipping {:?}: resolves outside the plugin directory", path);
            continue;
        }
        candidates.push(path);
    }
    candidates.sort();
    Ok(candidates)
}

/// Turns a trusted library file into step definitions
pub trait StepLibraryLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Vec<StepDefinition>, PluginError>;
}

/// Loads `abi_stable` step libraries
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeStepLoader;

impl StepLibraryLoader for NativeStepLoader {
    fn load(&self, path: &Path) -> Result<Vec<StepDefinition>, PluginError> {
        let library = LoadedStepLibrary::load(path).map_err(|e| PluginError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        library
            .steps()
            .into_iter()
            .map(|descriptor| plugin_definition(&library, &descriptor))
            .collect()
    }
}

/// Build a definition that forwards execution to `library`
pub fn plugin_definition(
    library: &LoadedStepLibrary,
    descriptor: &StepDescriptor,
) -> Result<StepDefinition, PluginError> {
    let invalid = |message: String| PluginError::InvalidSchema {
        step_id: descriptor.step_id.clone(),
        message,
    };
    let raw = descriptor
        .schema_value()
        .map_err(|e| invalid(e.to_string()))?;
    let schema = ParameterSchema::from_value(&raw).map_err(invalid)?;

    let library = library.clone();
    let step_id = descriptor.step_id.clone();
    let name = descriptor.name.clone();
    Ok(StepDefinition::new(
        &descriptor.step_id,
        &descriptor.name,
        &descriptor.category,
        schema,
        ParameterShape::Plugin,
        move |parameters| {
            let parameters = match parameters {
                StepParameters::Plugin(map) => map,
                _ => Map::new(),
            };
            Box::new(PluginStep {
                step_id: step_id.clone(),
                name: name.clone(),
                library: library.clone(),
                parameters,
            })
        },
    ))
}

/// A library that passed the trust gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedLibrary {
    pub path: PathBuf,
    /// Digest of the content that was verified
    pub sha256: String,
    pub trust: Trust,
}

/// Candidate libraries that pass the trust gate, in sorted order.
pub fn trusted_libraries(options: &PluginOptions) -> Result<Vec<TrustedLibrary>, PluginError> {
    let Some(directory) = &options.directory else {
        return Ok(Vec::new());
    };

    let mut trusted = Vec::new();
    for path in candidate_libraries(directory)? {
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Cannot read plugin {:?}: {}", path, e);
                continue;
            }
        };

        match verify_trust(options, &path, &bytes) {
            Some(trust) => {
                tracing::debug!(?trust, "Plugin {:?} trusted", path);
                trusted.push(TrustedLibrary {
                    path,
                    sha256: content_hash(&bytes),
                    trust,
                });
            }
            None => tracing::debug!("Plugin {:?} is not trusted; skipping", path),
        }
    }
    Ok(trusted)
}

/// Load a verified library.
///
/// The file is read again and must still hash to the verified digest. The
/// loader then opens a private copy of exactly those bytes, so a file
/// replaced after verification is refused and never loaded.
pub fn load_trusted(
    library: &TrustedLibrary,
    loader: &dyn StepLibraryLoader,
) -> Result<Vec<StepDefinition>, PluginError> {
    let bytes = fs::read(&library.path)?;
    if !content_hash(&bytes).eq_ignore_ascii_case(&library.sha256) {
        return Err(PluginError::Changed(library.path.clone()));
    }

    let staging = tempfile::Builder::new()
        .prefix("station-plugin-")
        .tempdir()?;
    let staged = staging
        .path()
        .join(library.path.file_name().unwrap_or_default());
    fs::write(&staged, &bytes)?;
    // Loaded libraries stay mapped after the staging directory is removed
    loader.load(&staged)
}

/// Scan the configured directory and load every trusted library.
///
/// Returns each library that loaded together with its definitions.
pub fn discover_plugins(
    options: &PluginOptions,
    loader: &dyn StepLibraryLoader,
) -> Result<Vec<(TrustedLibrary, Vec<StepDefinition>)>, PluginError> {
    let mut loaded = Vec::new();
    for library in trusted_libraries(options)? {
        match load_trusted(&library, loader) {
            Ok(definitions) => {
                tracing::info!(steps = definitions.len(), "Registered plugin {:?}", library.path);
                loaded.push((library, definitions));
            }
            Err(e) => tracing::warn!("Skipping plugin {:?}: {}", library.path, e),
        }
    }
    Ok(loaded)
}

// =============================================================================
// Plugin Step
// =============================================================================

/// A step executed by a native library
pub struct PluginStep {
    step_id: String,
    name: String,
    library: LoadedStepLibrary,
    parameters: Map<String, Value>,
}

#[async_trait]
impl TestStep for PluginStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StepResult> {
        let params_json = serde_json::to_string(&self.parameters)?;
        let mut items = RHashMap::new();
        for (key, value) in ctx.text_items() {
            items.insert(RString::from(key), RString::from(value));
        }
        let ffi_ctx = FfiStepContext {
            slot_id: ctx.slot_id(),
            serial: RString::from(ctx.serial_number()),
            items,
        };

        let library = self.library.clone();
        let step_id = self.step_id.clone();
        let call = blocking_until_cancelled(cancel, move || {
            library.execute(&step_id, &params_json, ffi_ctx)
        });
        let Some(output) = call.await? else {
            ctx.log().warn(format!(
                "Plugin step {} cancelled; its library call keeps running detached",
                self.step_id
            ));
            return Err(InstrumentError::Cancelled.into());
        };
        let output = output.map_err(|message| PluginError::Execution {
            step_id: self.step_id.clone(),
            message,
        })?;

        for tuple in output.items.iter() {
            ctx.set_text(tuple.0.to_string(), tuple.1.to_string());
        }

        if output.passed {
            Ok(StepResult::pass(self.name()))
        } else {
            let message = output
                .message
                .into_option()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "Plugin step failed".to_string());
            Ok(StepResult::fail(self.name(), message))
        }
    }
}

/// Run synchronous plugin code on the blocking pool.
///
/// Returns `None` as soon as `cancel` fires. A blocking call cannot be
/// interrupted, so it finishes detached and its output is discarded.
async fn blocking_until_cancelled<T, F>(
    cancel: &CancellationToken,
    f: F,
) -> anyhow::Result<Option<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let call = tokio::task::spawn_blocking(f);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(None),
        joined = call => Ok(Some(joined?)),
    }
}

//! Integration tests for plugin discovery and the trust gate.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_station::config::StationConfig;
use rust_station::error::PluginError;
use rust_station::instruments::{HealthCheckOptions, MockInstrumentOptions};
use rust_station::limits::LimitTable;
use rust_station::manifest::content_hash;
use rust_station::report::MemoryReportSink;
use rust_station::results::StepResult;
use rust_station::station::StationController;
use rust_station::steps::plugin::{
    load_trusted, seal_path, trusted_libraries, PublisherSeal, Trust,
};
use rust_station::steps::{
    ParamType, ParameterSchema, ParameterShape, PluginOptions, RunContext, StepDefinition,
    StepLibraryLoader, StepRegistry, TestStep,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const LIB_EXT: &str = std::env::consts::DLL_EXTENSION;

struct NamedStep(String);

#[async_trait]
impl TestStep for NamedStep {
    fn name(&self) -> &str {
        &self.0
    }

    async fn execute(
        &self,
        _ctx: &RunContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<StepResult> {
        Ok(StepResult::pass(self.name()))
    }
}

/// Pretends every library exports one step named after its file stem
#[derive(Default)]
struct FakeLoader {
    loaded: Mutex<Vec<PathBuf>>,
    contents: Mutex<Vec<Vec<u8>>>,
    broken: Option<String>,
}

impl StepLibraryLoader for FakeLoader {
    fn load(&self, path: &Path) -> Result<Vec<StepDefinition>, PluginError> {
        self.loaded.lock().push(path.to_path_buf());
        self.contents.lock().push(std::fs::read(path)?);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.broken.as_deref() == Some(stem.as_str()) {
            return Err(PluginError::Load {
                path: path.to_path_buf(),
                message: "missing root module".to_string(),
            });
        }
        let step_id = format!("plugin.{}", stem);
        let name = stem.clone();
        Ok(vec![StepDefinition::new(
            &step_id,
            &stem,
            "Plugin",
            ParameterSchema::empty().property("label", ParamType::String),
            ParameterShape::Plugin,
            move |_| Box::new(NamedStep(name.clone())),
        )])
    }
}

fn write_library(dir: &TempDir, stem: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(format!("{}.{}", stem, LIB_EXT));
    std::fs::write(&path, bytes).unwrap();
    path
}

fn write_seal(library: &Path, publisher: &str, sha256: String) {
    let seal = PublisherSeal {
        publisher: publisher.to_string(),
        sha256,
    };
    std::fs::write(seal_path(library), serde_json::to_string(&seal).unwrap()).unwrap();
}

#[test]
fn only_trusted_libraries_are_loaded() {
    let dir = TempDir::new().unwrap();
    write_library(&dir, "rogue", b"rogue bytes");
    write_library(&dir, "listed", b"listed bytes");
    let sealed = write_library(&dir, "sealed", b"sealed bytes");
    write_seal(&sealed, "Station Team", content_hash(b"sealed bytes"));
    let forged = write_library(&dir, "forged", b"forged bytes");
    write_seal(&forged, "Station Team", content_hash(b"something else"));

    let options = PluginOptions::in_directory(dir.path())
        .allow_sha256(content_hash(b"listed bytes"))
        .trust_publisher("Station Team");
    let loader = FakeLoader::default();
    let registry = StepRegistry::discover_with(&options, &loader).unwrap();

    assert!(registry.contains("plugin.listed"));
    assert!(registry.contains("plugin.sealed"));
    assert!(!registry.contains("plugin.rogue"));
    assert!(!registry.contains("plugin.forged"));

    // untrusted files are never handed to the loader
    let loaded: Vec<String> = loader
        .loaded
        .lock()
        .iter()
        .map(|p| p.file_stem().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(loaded, vec!["listed", "sealed"]);

    // built-ins are still present
    assert!(registry.contains("Safety"));
}

#[test]
fn seal_from_untrusted_publisher_is_ignored() {
    let dir = TempDir::new().unwrap();
    let library = write_library(&dir, "thirdparty", b"vendor bytes");
    write_seal(&library, "Someone Else", content_hash(b"vendor bytes"));

    let options = PluginOptions::in_directory(dir.path()).trust_publisher("Station Team");
    let registry = StepRegistry::discover_with(&options, &FakeLoader::default()).unwrap();
    assert!(!registry.contains("plugin.thirdparty"));
}

#[test]
fn load_failure_skips_only_that_library() {
    let dir = TempDir::new().unwrap();
    write_library(&dir, "good", b"good");
    write_library(&dir, "bad", b"bad");

    let options = PluginOptions::in_directory(dir.path())
        .allow_sha256(content_hash(b"good"))
        .allow_sha256(content_hash(b"bad"));
    let loader = FakeLoader {
        broken: Some("bad".to_string()),
        ..FakeLoader::default()
    };
    let registry = StepRegistry::discover_with(&options, &loader).unwrap();

    assert!(registry.contains("plugin.good"));
    assert!(!registry.contains("plugin.bad"));
}

#[test]
fn plugin_parameters_are_validated_against_schema() {
    let dir = TempDir::new().unwrap();
    write_library(&dir, "labelled", b"labelled");
    let options = PluginOptions::in_directory(dir.path()).allow_sha256(content_hash(b"labelled"));
    let registry = StepRegistry::discover_with(&options, &FakeLoader::default()).unwrap();

    let ok = serde_json::json!({ "label": "DUT" });
    assert!(registry.bind_parameters("plugin.labelled", Some(&ok)).is_ok());

    let unknown = serde_json::json!({ "colour": "red" });
    assert!(registry.bind_parameters("plugin.labelled", Some(&unknown)).is_err());
}

#[test]
fn missing_directory_and_file_path() {
    let dir = TempDir::new().unwrap();

    let missing = PluginOptions::in_directory(dir.path().join("absent"));
    let registry = StepRegistry::discover_with(&missing, &FakeLoader::default()).unwrap();
    assert_eq!(registry.len(), StepRegistry::builtin().len());

    let file = dir.path().join("not_a_dir.txt");
    std::fs::write(&file, "x").unwrap();
    let not_a_dir = PluginOptions::in_directory(&file);
    assert!(matches!(
        StepRegistry::discover_with(&not_a_dir, &FakeLoader::default()),
        Err(PluginError::InvalidDirectory(_))
    ));
}

#[test]
fn trusted_libraries_are_sorted() {
    let dir = TempDir::new().unwrap();
    write_library(&dir, "zeta", b"z");
    write_library(&dir, "alpha", b"a");
    let options = PluginOptions::in_directory(dir.path())
        .allow_sha256(content_hash(b"z"))
        .allow_sha256(content_hash(b"a"));

    let names: Vec<String> = trusted_libraries(&options)
        .unwrap()
        .iter()
        .map(|l| l.path.file_stem().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
}

#[test]
fn library_replaced_after_verification_is_refused() {
    let dir = TempDir::new().unwrap();
    let path = write_library(&dir, "swapped", b"verified bytes");
    let options =
        PluginOptions::in_directory(dir.path()).allow_sha256(content_hash(b"verified bytes"));

    let trusted = trusted_libraries(&options).unwrap();
    assert_eq!(trusted.len(), 1);
    assert_eq!(trusted[0].trust, Trust::AllowListed);
    assert_eq!(trusted[0].sha256, content_hash(b"verified bytes"));

    std::fs::write(&path, b"replacement bytes").unwrap();

    let loader = FakeLoader::default();
    assert!(matches!(
        load_trusted(&trusted[0], &loader),
        Err(PluginError::Changed(_))
    ));
    assert!(loader.loaded.lock().is_empty());
}

#[test]
fn loader_receives_private_copy_of_verified_bytes() {
    let dir = TempDir::new().unwrap();
    write_library(&dir, "copied", b"copied bytes");
    let options =
        PluginOptions::in_directory(dir.path()).allow_sha256(content_hash(b"copied bytes"));
    let trusted = trusted_libraries(&options).unwrap();

    let loader = FakeLoader::default();
    let definitions = load_trusted(&trusted[0], &loader).unwrap();
    assert_eq!(definitions.len(), 1);

    let loaded = loader.loaded.lock().clone();
    let root = dir.path().canonicalize().unwrap();
    assert!(!loaded[0].starts_with(&root));
    assert_eq!(loaded[0].file_name(), trusted[0].path.file_name());
    assert_eq!(loader.contents.lock()[0], b"copied bytes".to_vec());
}

#[tokio::test]
async fn manifests_list_only_libraries_that_loaded() {
    let dir = TempDir::new().unwrap();
    write_library(&dir, "good", b"good");
    write_library(&dir, "bad", b"bad");
    let options = PluginOptions::in_directory(dir.path())
        .allow_sha256(content_hash(b"good"))
        .allow_sha256(content_hash(b"bad"));
    let loader = FakeLoader {
        broken: Some("bad".to_string()),
        ..FakeLoader::default()
    };
    let registry = StepRegistry::discover_with(&options, &loader).unwrap();

    let recorded: Vec<&str> = registry
        .plugin_libraries()
        .iter()
        .map(|l| l.sha256.as_str())
        .collect();
    let good_hash = content_hash(b"good");
    assert_eq!(recorded, vec![good_hash.as_str()]);

    let mut config = StationConfig::default();
    config.slot_count = 1;
    config.step_plan = vec!["Safety".into()];
    config.health = HealthCheckOptions::disabled();
    config.mock = MockInstrumentOptions::fast();
    let reports = Arc::new(MemoryReportSink::new());
    StationController::new(config, registry, LimitTable::new(), reports.clone())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let manifests = reports.manifests();
    let hashes = &manifests[0].1.snapshot.plugin_hashes;
    assert_eq!(hashes.len(), 1);
    assert_eq!(
        hashes.get(&format!("good.{}", LIB_EXT)).map(String::as_str),
        Some(good_hash.as_str())
    );
}

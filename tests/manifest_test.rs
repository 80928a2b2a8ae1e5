//! Run manifest hashing and deterministic serialization.

use chrono::{TimeZone, Utc};
use rust_station::manifest::{content_hash, file_hash, RunManifest, RunManifestBuilder};
use std::path::Path;
use tempfile::TempDir;

const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

fn fixed_manifest(dir: &Path) -> RunManifest {
    let config = dir.join("station.toml");
    let limits = dir.join("limits.csv");
    let plugin = dir.join("vendor_steps.so");
    std::fs::write(&config, "slot_count = 2\n").unwrap();
    std::fs::write(&limits, "Name,Unit,LSL,USL\nVoltage,V,3.0,3.6\n").unwrap();

    RunManifestBuilder::new()
        .config_file(Some(config.as_path()))
        .limits_file(Some(limits.as_path()))
        .plugins([(plugin, content_hash(b"\x7fELF"))])
        .instruments(["MockPsu", "MockDmm", "MockCan"])
        .operator(Some("op-17".to_string()))
        .created_at(Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap())
        .build("run-1", "SN0001")
}

#[test]
fn identical_inputs_serialize_identically() {
    let dir = TempDir::new().unwrap();
    let first = fixed_manifest(dir.path()).to_json().unwrap();
    let second = fixed_manifest(dir.path()).to_json().unwrap();
    assert_eq!(first, second);

    let manifest = RunManifest::from_json(&first).unwrap();
    assert_eq!(
        manifest.snapshot.instrument_identities,
        vec!["MockCan", "MockDmm", "MockPsu"]
    );
    assert_eq!(manifest.snapshot.operator_id.as_deref(), Some("op-17"));
    assert_eq!(
        manifest.snapshot.plugin_hashes.get("vendor_steps.so").map(String::as_str),
        Some(content_hash(b"\x7fELF").as_str())
    );
}

#[test]
fn changed_config_changes_hash() {
    let dir = TempDir::new().unwrap();
    let before = fixed_manifest(dir.path());
    std::fs::write(dir.path().join("station.toml"), "slot_count = 3\n").unwrap();
    let config_hash = file_hash(&dir.path().join("station.toml"));

    assert_ne!(before.snapshot.config_hash, config_hash);
    assert_eq!(before.snapshot.limits_hash, file_hash(&dir.path().join("limits.csv")));
}

#[test]
fn absent_inputs_hash_as_empty_content() {
    let dir = TempDir::new().unwrap();
    let manifest = RunManifestBuilder::new()
        .config_file(None)
        .limits_file(Some(dir.path().join("missing.csv").as_path()))
        .build("run-2", "SN0002");

    assert_eq!(manifest.snapshot.config_hash, EMPTY_SHA256);
    assert_eq!(manifest.snapshot.limits_hash, EMPTY_SHA256);
    assert!(manifest.snapshot.plugin_hashes.is_empty());
    assert!(manifest.snapshot.operator_id.is_none());
}

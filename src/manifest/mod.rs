//! Run manifests.
//!
//! A manifest pins down what a slot-run executed with: the config and limit
//! files, each plugin library and the instrument identities, all as content
//! hashes or sorted names. Serialization is deterministic: identical inputs
//! produce byte-identical JSON.

pub mod hashing;

pub use hashing::{content_hash, file_hash, optional_file_hash};

use crate::error::StationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Hashed inputs of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub config_hash: String,
    pub limits_hash: String,
    /// Library file name to content hash, ordered by name
    pub plugin_hashes: BTreeMap<String, String>,
    /// Sorted ascending
    pub instrument_identities: Vec<String>,
    pub operator_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub serial: String,
    pub created_at: DateTime<Utc>,
    pub snapshot: RunSnapshot,
}

impl RunManifest {
    /// Pretty-printed JSON
    pub fn to_json(&self) -> StationResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> StationResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Collects manifest inputs; config and limit files are hashed on
/// [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct RunManifestBuilder {
    config_path: Option<PathBuf>,
    limits_path: Option<PathBuf>,
    plugin_hashes: BTreeMap<String, String>,
    instrument_identities: Vec<String>,
    operator_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

impl RunManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_file(mut self, path: Option<&Path>) -> Self {
        self.config_path = path.map(Path::to_path_buf);
        self
    }

    pub fn limits_file(mut self, path: Option<&Path>) -> Self {
        self.limits_path = path.map(Path::to_path_buf);
        self
    }

    /// Plugin libraries with the digest each was verified and loaded with.
    /// Entries are keyed by file name.
    pub fn plugins<I, P, H>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = (P, H)>,
        P: AsRef<Path>,
        H: Into<String>,
    {
        for (path, sha256) in plugins {
            if let Some(name) = path.as_ref().file_name() {
                self.plugin_hashes
                    .insert(name.to_string_lossy().into_owned(), sha256.into());
            }
        }
        self
    }

    pub fn instruments<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instrument_identities
            .extend(identities.into_iter().map(Into::into));
        self
    }

    pub fn operator(mut self, operator_id: Option<String>) -> Self {
        self.operator_id = operator_id;
        self
    }

    /// Fix the creation time instead of using the build time
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn build(self, run_id: impl Into<String>, serial: impl Into<String>) -> RunManifest {
        let mut instrument_identities: Vec<String> = self
            .instrument_identities
            .into_iter()
            .filter(|identity| !identity.trim().is_empty())
            .collect();
        instrument_identities.sort();

        RunManifest {
            run_id: run_id.into(),
            serial: serial.into(),
            created_at: self.created_at.unwrap_or_else(Utc::now),
            snapshot: RunSnapshot {
                config_hash: optional_file_hash(self.config_path.as_deref()),
                limits_hash: optional_file_hash(self.limits_path.as_deref()),
                plugin_hashes: self.plugin_hashes,
                instrument_identities,
                operator_id: self.operator_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_sorted_and_blank_entries_dropped() {
        let manifest = RunManifestBuilder::new()
            .instruments(["MockPsu", " ", "MockCan", "MockDmm"])
            .build("run", "SN0001");
        assert_eq!(
            manifest.snapshot.instrument_identities,
            vec!["MockCan", "MockDmm", "MockPsu"]
        );
    }

    #[test]
    fn json_roundtrip_preserves_manifest() {
        let manifest = RunManifestBuilder::new()
            .operator(Some("op-7".into()))
            .build("run-1", "SN0002");
        let parsed = RunManifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(parsed, manifest);
    }
}

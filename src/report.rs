//! Report sinks.
//!
//! The station controller hands every finished slot report, slot manifest
//! and the run summary to a [`ReportSink`]. It never reads them back.
//!
//! [`JsonReportWriter`] lays a run out on disk as:
//!
//! ```text
//! <root>/Run/<yyyyMMdd>/<HHmmss>_<run id>/
//!     slot_01.json
//!     manifest_slot_01.json
//!     summary.json
//!     summary.csv
//! ```

use crate::error::{StationError, StationResult};
use crate::manifest::RunManifest;
use crate::results::{RunSummary, SlotReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Called once before any slot of the run reports
    async fn begin_run(&self, _run_id: Uuid, _started_at: DateTime<Utc>) -> StationResult<()> {
        Ok(())
    }

    async fn write_slot_report(&self, report: &SlotReport) -> StationResult<()>;

    async fn write_manifest(
        &self,
        run_id: Uuid,
        slot_id: u32,
        manifest: &RunManifest,
    ) -> StationResult<()>;

    /// `reports` are ordered by slot id
    async fn write_summary(&self, summary: &RunSummary, reports: &[SlotReport])
        -> StationResult<()>;
}

// =============================================================================
// JSON / CSV writer
// =============================================================================

pub struct JsonReportWriter {
    root: PathBuf,
    runs: Mutex<HashMap<Uuid, PathBuf>>,
}

impl JsonReportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything written for `run_id`
    pub fn run_directory(&self, run_id: Uuid, started_at: DateTime<Utc>) -> PathBuf {
        self.runs
            .lock()
            .entry(run_id)
            .or_insert_with(|| {
                self.root
                    .join("Run")
                    .join(started_at.format("%Y%m%d").to_string())
                    .join(format!("{}_{}", started_at.format("%H%M%S"), run_id.simple()))
            })
            .clone()
    }

    async fn write_json<T: serde::Serialize + Sync>(
        &self,
        directory: &Path,
        file_name: &str,
        value: &T,
    ) -> StationResult<()> {
        tokio::fs::create_dir_all(directory).await?;
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(directory.join(file_name), json).await?;
        Ok(())
    }
}

fn summary_csv(reports: &[SlotReport]) -> StationResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["SlotId", "SerialNumber", "FinalState", "StartUtc", "FinishedUtc"])?;
    for report in reports {
        writer.write_record([
            report.slot_id.to_string(),
            report.serial_number.clone(),
            report.final_state.to_string(),
            report.started_at.to_rfc3339(),
            report.finished_at.to_rfc3339(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|e| StationError::Io(e.into_error()))
}

#[async_trait]
impl ReportSink for JsonReportWriter {
    async fn begin_run(&self, run_id: Uuid, started_at: DateTime<Utc>) -> StationResult<()> {
        let directory = self.run_directory(run_id, started_at);
        tokio::fs::create_dir_all(&directory).await?;
        tracing::info!("Writing run reports to {:?}", directory);
        Ok(())
    }

    async fn write_slot_report(&self, report: &SlotReport) -> StationResult<()> {
        let directory = self.run_directory(report.run_id, report.started_at);
        let file_name = format!("slot_{:02}.json", report.slot_id);
        self.write_json(&directory, &file_name, report).await
    }

    async fn write_manifest(
        &self,
        run_id: Uuid,
        slot_id: u32,
        manifest: &RunManifest,
    ) -> StationResult<()> {
        let directory = self.run_directory(run_id, manifest.created_at);
        tokio::fs::create_dir_all(&directory).await?;
        let path = directory.join(format!("manifest_slot_{:02}.json", slot_id));
        tokio::fs::write(path, manifest.to_json()?).await?;
        Ok(())
    }

    async fn write_summary(
        &self,
        summary: &RunSummary,
        reports: &[SlotReport],
    ) -> StationResult<()> {
        let directory = self.run_directory(summary.run_id, summary.started_at);
        let written = async {
            self.write_json(&directory, "summary.json", summary).await?;
            tokio::fs::write(directory.join("summary.csv"), summary_csv(reports)?).await?;
            Ok::<(), StationError>(())
        }
        .await;
        // The summary closes the run
        self.runs.lock().remove(&summary.run_id);
        written
    }
}

impl std::fmt::Debug for JsonReportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonReportWriter")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// In-memory sink
// =============================================================================

/// Keeps everything in memory; used by tests and embedders.
#[derive(Debug, Default)]
pub struct MemoryReportSink {
    reports: Mutex<Vec<SlotReport>>,
    manifests: Mutex<Vec<(u32, RunManifest)>>,
    summaries: Mutex<Vec<RunSummary>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<SlotReport> {
        self.reports.lock().clone()
    }

    pub fn manifests(&self) -> Vec<(u32, RunManifest)> {
        self.manifests.lock().clone()
    }

    pub fn summaries(&self) -> Vec<RunSummary> {
        self.summaries.lock().clone()
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn write_slot_report(&self, report: &SlotReport) -> StationResult<()> {
        self.reports.lock().push(report.clone());
        Ok(())
    }

    async fn write_manifest(
        &self,
        _run_id: Uuid,
        slot_id: u32,
        manifest: &RunManifest,
    ) -> StationResult<()> {
        self.manifests.lock().push((slot_id, manifest.clone()));
        Ok(())
    }

    async fn write_summary(
        &self,
        summary: &RunSummary,
        _reports: &[SlotReport],
    ) -> StationResult<()> {
        self.summaries.lock().push(summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::SlotState;
    use tempfile::TempDir;

    fn report(run_id: Uuid, slot_id: u32, started_at: DateTime<Utc>) -> SlotReport {
        SlotReport {
            slot_id,
            serial_number: format!("SN{:04}", slot_id),
            final_state: SlotState::Pass,
            steps: Vec::new(),
            started_at,
            finished_at: started_at,
            run_id,
        }
    }

    #[tokio::test]
    async fn writer_lays_out_run_directory() {
        let root = TempDir::new().unwrap();
        let writer = JsonReportWriter::new(root.path());
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        writer.begin_run(run_id, started_at).await.unwrap();
        let reports = vec![report(run_id, 1, started_at), report(run_id, 2, started_at)];
        for r in &reports {
            writer.write_slot_report(r).await.unwrap();
        }
        let summary = RunSummary::from_reports(run_id, started_at, Utc::now(), &reports);
        let directory = writer.run_directory(run_id, started_at);
        writer.write_summary(&summary, &reports).await.unwrap();
        assert!(writer.runs.lock().is_empty());

        assert!(directory.starts_with(root.path().join("Run")));
        assert!(directory.join("slot_01.json").is_file());
        assert!(directory.join("slot_02.json").is_file());
        assert!(directory.join("summary.json").is_file());

        let csv = std::fs::read_to_string(directory.join("summary.csv")).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("SlotId,SerialNumber,FinalState,StartUtc,FinishedUtc")
        );
        assert!(lines.next().unwrap().starts_with("1,SN0001,Pass,"));
    }

    #[tokio::test]
    async fn run_directory_is_fixed_by_first_use() {
        let root = TempDir::new().unwrap();
        let writer = JsonReportWriter::new(root.path());
        let run_id = Uuid::new_v4();
        let first = writer.run_directory(run_id, Utc::now());
        let later = writer.run_directory(run_id, Utc::now() + chrono::Duration::hours(1));
        assert_eq!(first, later);
    }
}

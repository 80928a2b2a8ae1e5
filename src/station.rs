//! Station controller.
//!
//! Fans a run out over `slot_count` parallel slots. Each slot gets:
//! - its own [`InstrumentManager`] (isolated devices, leases and breakers)
//! - a fresh correlation id and [`SlotLogger`]
//! - a child of the run's cancellation token
//!
//! and drives the [`SequenceRunner`] over the resolved step plan. One slot's
//! failure never affects another. Every slot ends with a report in one of
//! three final states:
//!
//! | outcome                                         | state     |
//! |-------------------------------------------------|-----------|
//! | sequence passed                                 | `Pass`    |
//! | sequence failed, binding/init failed, panicked  | `Fail`    |
//! | cancelled                                       | `Stopped` |
//!
//! Progress is published on a broadcast channel of [`StationEvent`]s.
//! Subscribing is optional.

use crate::config::StationConfig;
use crate::defaults::EVENT_CHANNEL_CAPACITY;
use crate::error::{is_cancelled, StationResult};
use crate::instruments::{
    DeviceSet, InstrumentManager, InstrumentManagerConfig, InstrumentServices,
};
use crate::limits::LimitTable;
use crate::logging::{LogEntry, LogSink, SlotLogger, TracingSink};
use crate::manifest::{RunManifest, RunManifestBuilder};
use crate::report::{JsonReportWriter, ReportSink};
use crate::results::{RunSummary, SlotReport, SlotState, StepResult};
use crate::sequence::{panic_message, SequenceResult, SequenceRunner, StepState};
use crate::steps::{ResolvedStep, RunContext, StepRegistry, TestStep, TrustedLibrary};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Builds the raw devices for a slot
pub type DeviceFactory = Arc<dyn Fn(u32, &InstrumentManagerConfig) -> DeviceSet + Send + Sync>;

/// Progress notifications published during a run
#[derive(Debug, Clone)]
pub enum StationEvent {
    RunStarted {
        run_id: Uuid,
        slot_count: u32,
    },
    SlotStateChanged {
        slot_id: u32,
        state: SlotState,
    },
    StepStateChanged {
        slot_id: u32,
        step: String,
        state: StepState,
    },
    Log(LogEntry),
    RunFinished(RunSummary),
}

/// Forwards slot log entries to the station sink and the event channel
struct EventLogSink {
    inner: Arc<dyn LogSink>,
    events: broadcast::Sender<StationEvent>,
}

impl LogSink for EventLogSink {
    fn log(&self, entry: LogEntry) {
        self.inner.log(entry.clone());
        // No subscribers is fine
        let _ = self.events.send(StationEvent::Log(entry));
    }
}

pub struct StationController {
    config: Arc<StationConfig>,
    registry: Arc<StepRegistry>,
    limits: Arc<LimitTable>,
    reports: Arc<dyn ReportSink>,
    log_sink: Arc<dyn LogSink>,
    devices: Option<DeviceFactory>,
    config_file: Option<PathBuf>,
    plugins: Arc<Vec<TrustedLibrary>>,
    events: broadcast::Sender<StationEvent>,
}

impl StationController {
    pub fn new(
        config: StationConfig,
        registry: StepRegistry,
        limits: LimitTable,
        reports: Arc<dyn ReportSink>,
    ) -> Self {
        let plugins = registry.plugin_libraries().to_vec();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            limits: Arc::new(limits),
            reports,
            log_sink: Arc::new(TracingSink),
            devices: None,
            config_file: None,
            plugins: Arc::new(plugins),
            events,
        }
    }

    /// Discover steps, load limits and write reports under `report_root`.
    pub fn from_config(config: StationConfig) -> StationResult<Self> {
        let registry = StepRegistry::discover(&config.plugins)?;
        let limits = match &config.limits_csv {
            Some(path) => LimitTable::load(path)?,
            None => LimitTable::new(),
        };
        let reports = Arc::new(JsonReportWriter::new(&config.report_root));
        Ok(Self::new(config, registry, limits, reports))
    }

    /// Send slot log entries to `sink` instead of `tracing`
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    /// Replace the simulated devices
    pub fn with_devices(mut self, factory: DeviceFactory) -> Self {
        self.devices = Some(factory);
        self
    }

    /// Config file hashed into each manifest
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Subscribe before calling [`run`](Self::run) to see every event.
    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StationEvent) {
        let _ = self.events.send(event);
    }

    /// Run every slot to completion or cancellation and return the summary.
    ///
    /// Only report persistence of the run itself (`begin_run`, the summary)
    /// fails the call; slot-level problems end up in slot reports.
    pub async fn run(&self, cancel: &CancellationToken) -> StationResult<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let slot_count = self.config.slot_count;

        self.reports.begin_run(run_id, started_at).await?;

        let plan = self.registry.resolve_plan(&self.config.step_plan);
        if plan.is_empty() {
            tracing::warn!("No step plan entry resolved to a registered step");
        }
        let plan = Arc::new(plan);

        tracing::info!(%run_id, slot_count, station = %self.config.station_name, "Run started");
        self.emit(StationEvent::RunStarted { run_id, slot_count });

        let log_sink: Arc<dyn LogSink> = Arc::new(EventLogSink {
            inner: self.log_sink.clone(),
            events: self.events.clone(),
        });

        let mut handles = Vec::with_capacity(slot_count as usize);
        for slot_id in 1..=slot_count {
            let job = SlotJob {
                run_id,
                slot_id,
                plan: plan.clone(),
                config: self.config.clone(),
                limits: self.limits.clone(),
                log_sink: log_sink.clone(),
                devices: self.devices.clone(),
                config_file: self.config_file.clone(),
                plugins: self.plugins.clone(),
                events: self.events.clone(),
            };
            let slot_cancel = cancel.child_token();
            handles.push((slot_id, tokio::spawn(job.run(slot_cancel))));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (slot_id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(slot_id, "Slot task failed: {}", e);
                    SlotOutcome::failed(run_id, slot_id, started_at)
                }
            };

            if let Some(manifest) = &outcome.manifest {
                if let Err(e) = self.reports.write_manifest(run_id, slot_id, manifest).await {
                    tracing::error!(slot_id, "Failed to write manifest: {}", e);
                }
            }
            if let Err(e) = self.reports.write_slot_report(&outcome.report).await {
                tracing::error!(slot_id, "Failed to write slot report: {}", e);
            }
            reports.push(outcome.report);
        }

        let summary = RunSummary::from_reports(run_id, started_at, Utc::now(), &reports);
        self.reports.write_summary(&summary, &reports).await?;

        tracing::info!(
            %run_id,
            passed = summary.passed,
            failed = summary.failed,
            stopped = summary.stopped,
            "Run finished"
        );
        self.emit(StationEvent::RunFinished(summary.clone()));
        Ok(summary)
    }
}

impl std::fmt::Debug for StationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationController")
            .field("station", &self.config.station_name)
            .field("slot_count", &self.config.slot_count)
            .field("steps", &self.registry.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Slot execution
// =============================================================================

struct SlotOutcome {
    report: SlotReport,
    manifest: Option<RunManifest>,
}

impl SlotOutcome {
    fn failed(run_id: Uuid, slot_id: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            report: SlotReport {
                slot_id,
                serial_number: serial_number(slot_id),
                final_state: SlotState::Fail,
                steps: Vec::new(),
                started_at,
                finished_at: Utc::now(),
                run_id,
            },
            manifest: None,
        }
    }
}

enum SlotAbort {
    Cancelled(Vec<StepResult>),
    Failed,
}

fn serial_number(slot_id: u32) -> String {
    format!("SN{:04}", slot_id)
}

/// Seed for a slot's simulated devices
fn slot_seed(slot_id: u32) -> u64 {
    u64::from(slot_id) * 11
}

struct SlotJob {
    run_id: Uuid,
    slot_id: u32,
    plan: Arc<Vec<ResolvedStep>>,
    config: Arc<StationConfig>,
    limits: Arc<LimitTable>,
    log_sink: Arc<dyn LogSink>,
    devices: Option<DeviceFactory>,
    config_file: Option<PathBuf>,
    plugins: Arc<Vec<TrustedLibrary>>,
    events: broadcast::Sender<StationEvent>,
}

impl SlotJob {
    async fn run(self, cancel: CancellationToken) -> SlotOutcome {
        let started_at = Utc::now();
        let outcome = AssertUnwindSafe(self.execute(&cancel)).catch_unwind().await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => {
                tracing::error!(
                    slot_id = self.slot_id,
                    "Slot panicked: {}",
                    panic_message(panic.as_ref())
                );
                SlotOutcome::failed(self.run_id, self.slot_id, started_at)
            }
        };
        self.set_state(outcome.report.final_state);
        outcome
    }

    fn set_state(&self, state: SlotState) {
        let _ = self.events.send(StationEvent::SlotStateChanged {
            slot_id: self.slot_id,
            state,
        });
    }

    async fn execute(&self, cancel: &CancellationToken) -> SlotOutcome {
        let serial = serial_number(self.slot_id);
        let logger = SlotLogger::new(self.log_sink.clone(), Uuid::new_v4(), self.slot_id);
        self.set_state(SlotState::Running);

        let instrument_config = self.config.instrument_config(slot_seed(self.slot_id));
        let manager = match &self.devices {
            Some(factory) => InstrumentManager::with_devices(
                factory(self.slot_id, &instrument_config),
                &instrument_config,
                logger.clone(),
                cancel,
            ),
            None => InstrumentManager::new(&instrument_config, logger.clone(), cancel),
        };
        let manager = Arc::new(manager);

        let manifest = RunManifestBuilder::new()
            .config_file(self.config_file.as_deref())
            .limits_file(self.config.limits_csv.as_deref())
            .plugins(self.plugins.iter().map(|p| (&p.path, p.sha256.as_str())))
            .instruments(manager.identities())
            .operator(self.config.operator_id.clone())
            .build(self.run_id.to_string(), serial.clone());

        let ctx = RunContext::new(
            self.run_id,
            serial.clone(),
            manager.clone(),
            logger.clone(),
            self.limits.clone(),
        );
        logger.info(format!("Slot {} started ({})", self.slot_id, serial));

        let (final_state, steps) = match self.drive(&manager, &ctx, cancel).await {
            Ok(result) if result.passed => (SlotState::Pass, result.steps),
            Ok(result) => (SlotState::Fail, result.steps),
            Err(SlotAbort::Cancelled(partial)) => (SlotState::Stopped, partial),
            Err(SlotAbort::Failed) => (SlotState::Fail, Vec::new()),
        };

        manager.shutdown().await;
        logger.info(format!("Slot {} finished: {}", self.slot_id, final_state));

        SlotOutcome {
            report: SlotReport {
                slot_id: self.slot_id,
                serial_number: serial,
                final_state,
                steps,
                started_at: ctx.started_at(),
                finished_at: Utc::now(),
                run_id: self.run_id,
            },
            manifest: Some(manifest),
        }
    }

    async fn drive(
        &self,
        manager: &InstrumentManager,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<SequenceResult, SlotAbort> {
        let steps: Vec<Box<dyn TestStep>> = match self
            .plan
            .iter()
            .map(ResolvedStep::instantiate)
            .collect::<Result<_, _>>()
        {
            Ok(steps) => steps,
            Err(e) => {
                ctx.log().error(format!("Parameter binding failed: {}", e));
                return Err(SlotAbort::Failed);
            }
        };

        if let Err(e) = manager.initialize_all().await {
            if is_cancelled(&e) || cancel.is_cancelled() {
                return Err(SlotAbort::Cancelled(Vec::new()));
            }
            ctx.log()
                .error(format!("Instrument initialization failed: {:#}", e));
            return Err(SlotAbort::Failed);
        }

        let slot_id = self.slot_id;
        let events = self.events.clone();
        let runner = SequenceRunner::new(self.config.failure_policy).with_observer(Arc::new(
            move |step: &str, state: StepState| {
                let _ = events.send(StationEvent::StepStateChanged {
                    slot_id,
                    step: step.to_string(),
                    state,
                });
            },
        ));

        runner
            .run(&steps, ctx, cancel)
            .await
            .map_err(|cancelled| SlotAbort::Cancelled(cancelled.partial))
    }
}

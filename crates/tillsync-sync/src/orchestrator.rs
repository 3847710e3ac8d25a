//! Cadence tiers: an explicit registry of jobs per tier, run one after the
//! other on each tick.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tillsync_adapters::SourceError;
use tillsync_core::{CadenceTier, EntityKind, SyncWindow};
use tillsync_storage::{FetchArchive, StorageError};
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::recompute::{derived_field, derived_fields, DerivedField, RecomputeEngine, RecomputeReport};
use crate::reconcile::{ReconcileReport, ReconciliationEngine};
use crate::sink::{Boundary, ErrorSink, FailureEvent};
use crate::window::{plan_passes, ScopePass, WindowSyncEngine};

#[derive(Debug, Clone)]
pub struct TickContext {
    pub run_id: Uuid,
    pub tier: CadenceTier,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutcome {
    Synced {
        windows: usize,
        failed_windows: usize,
        fetched: usize,
        reconcile: ReconcileReport,
    },
    Recomputed {
        reports: Vec<RecomputeReport>,
        failed_fields: usize,
    },
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] SourceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("job exceeded its {0:?} deadline")]
    TimedOut(Duration),
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            JobError::Fetch(err) => err.is_transient(),
            JobError::Storage(_) | JobError::TimedOut(_) => true,
            JobError::Panicked(_) | JobError::Other(_) => false,
        }
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ctx: &TickContext) -> Result<JobOutcome, JobError>;
}

/// Jobs per tier, in the order they run.
#[derive(Default, Clone)]
pub struct JobRegistry {
    tiers: BTreeMap<CadenceTier, Vec<Arc<dyn Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tier: CadenceTier, job: Arc<dyn Job>) -> &mut Self {
        self.tiers.entry(tier).or_default().push(job);
        self
    }

    pub fn jobs(&self, tier: CadenceTier) -> &[Arc<dyn Job>] {
        self.tiers.get(&tier).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn job_names(&self, tier: CadenceTier) -> Vec<String> {
        self.jobs(tier).iter().map(|j| j.name().to_string()).collect()
    }
}

#[derive(Debug)]
pub struct JobReport {
    pub job: String,
    pub elapsed: Duration,
    pub result: Result<JobOutcome, JobError>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug)]
pub struct TierReport {
    pub run_id: Uuid,
    pub tier: CadenceTier,
    pub started_at: DateTime<Utc>,
    /// The previous firing of this tier was still running.
    pub skipped: bool,
    pub jobs: Vec<JobReport>,
}

impl TierReport {
    pub fn failed(&self) -> usize {
        self.jobs.iter().filter(|j| !j.succeeded()).count()
    }
}

pub struct ScheduleOrchestrator {
    registry: JobRegistry,
    sink: Arc<dyn ErrorSink>,
    job_timeout: Option<Duration>,
    running: BTreeMap<CadenceTier, Arc<Mutex<()>>>,
}

impl ScheduleOrchestrator {
    pub fn new(registry: JobRegistry, sink: Arc<dyn ErrorSink>) -> Self {
        let running = CadenceTier::ALL
            .into_iter()
            .map(|tier| (tier, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            registry,
            sink,
            job_timeout: None,
            running,
        }
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub async fn run_tier(&self, tier: CadenceTier) -> TierReport {
        self.run_tier_at(tier, Utc::now()).await
    }

    /// Run every job of `tier` sequentially. A failing job is reported and
    /// the next one still runs.
    pub async fn run_tier_at(&self, tier: CadenceTier, now: DateTime<Utc>) -> TierReport {
        let run_id = Uuid::new_v4();
        let mut report = TierReport {
            run_id,
            tier,
            started_at: now,
            skipped: false,
            jobs: Vec::new(),
        };

        let Some(lock) = self.running.get(&tier) else {
            return report;
        };
        let Ok(_running) = lock.try_lock() else {
            warn!(%run_id, %tier, "previous firing of tier still running; skipping");
            report.skipped = true;
            return report;
        };

        let ctx = TickContext { run_id, tier, now };
        let span = info_span!("tier_tick", %run_id, %tier);
        report.jobs = async {
            let mut jobs = Vec::new();
            for job in self.registry.jobs(tier) {
                jobs.push(self.run_job(Arc::clone(job), ctx.clone()).await);
            }
            jobs
        }
        .instrument(span)
        .await;

        info!(
            %run_id,
            %tier,
            jobs = report.jobs.len(),
            failed = report.failed(),
            "tier tick finished"
        );
        report
    }

    async fn run_job(&self, job: Arc<dyn Job>, ctx: TickContext) -> JobReport {
        let name = job.name().to_string();
        let started = Instant::now();
        let deadline = self.job_timeout;
        // spawned so a panic stays inside this job
        let handle = tokio::spawn(async move {
            match deadline {
                Some(limit) => tokio::time::timeout(limit, job.run(&ctx))
                    .await
                    .unwrap_or(Err(JobError::TimedOut(limit))),
                None => job.run(&ctx).await,
            }
        });
        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(JobError::Panicked(join_err.to_string())),
        };
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => info!(job = %name, elapsed_ms = elapsed.as_millis() as u64, "job finished"),
            Err(err) => self.sink.critical(&FailureEvent::new(
                Boundary::Job,
                name.clone(),
                err.to_string(),
                err.is_recoverable(),
            )),
        }
        JobReport {
            job: name,
            elapsed,
            result,
        }
    }
}

/// Fetch, archive and reconcile one window.
#[derive(Clone)]
pub struct SyncStep {
    pub engine: Arc<WindowSyncEngine>,
    pub reconciler: Arc<ReconciliationEngine>,
    pub archive: Option<Arc<FetchArchive>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WindowOutcome {
    pub fetched: usize,
    pub reconcile: ReconcileReport,
}

impl SyncStep {
    pub async fn sync_window(
        &self,
        run_id: Uuid,
        kinds: &[EntityKind],
        window: &SyncWindow,
    ) -> Result<WindowOutcome, SourceError> {
        let batch = self.engine.fetch(run_id, kinds, window).await?;
        let fetched = batch.len();

        if let Some(archive) = &self.archive {
            match serde_json::to_vec(&batch.records) {
                Ok(bytes) => {
                    match archive
                        .store_batch(window, self.engine.source_id(), &bytes)
                        .await
                    {
                        Ok(stored) => info!(
                            path = %stored.relative_path.display(),
                            bytes = stored.byte_size,
                            deduplicated = stored.deduplicated,
                            "batch archived"
                        ),
                        Err(err) => warn!(error = %err, "archiving batch failed"),
                    }
                }
                Err(err) => warn!(error = %err, "serializing batch for archive failed"),
            }
        }

        let reconcile = self.reconciler.reconcile_batch(batch).await;
        Ok(WindowOutcome { fetched, reconcile })
    }
}

/// Sync the tier's window for a set of kinds: once per scope for
/// store-partitioned kinds, once overall for the catalogue.
pub struct WindowSyncJob {
    name: String,
    passes: Vec<ScopePass>,
    step: SyncStep,
    sink: Arc<dyn ErrorSink>,
}

impl WindowSyncJob {
    pub fn new(
        name: impl Into<String>,
        kinds: Vec<EntityKind>,
        scopes: Vec<Option<String>>,
        step: SyncStep,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            name: name.into(),
            passes: plan_passes(&kinds, &scopes),
            step,
            sink,
        }
    }
}

#[async_trait]
impl Job for WindowSyncJob {
    fn name(&self) -> &str {
        &self.name
    }

    /// Fails only when every pass's fetch failed.
    async fn run(&self, ctx: &TickContext) -> Result<JobOutcome, JobError> {
        let mut fetched = 0;
        let mut failed_windows = 0;
        let mut reconcile = ReconcileReport::default();
        let mut last_error = None;

        for (scope, kinds) in &self.passes {
            let window = self.step.engine.window_for(ctx.tier, ctx.now, scope.clone());
            match self.step.sync_window(ctx.run_id, kinds, &window).await {
                Ok(outcome) => {
                    fetched += outcome.fetched;
                    reconcile.absorb(outcome.reconcile);
                }
                Err(err) => {
                    failed_windows += 1;
                    self.sink.critical(&FailureEvent::new(
                        Boundary::Fetch,
                        format!("{}@{}", self.name, scope.as_deref().unwrap_or("all")),
                        err.to_string(),
                        err.is_transient(),
                    ));
                    last_error = Some(err);
                }
            }
        }

        if failed_windows == self.passes.len() {
            if let Some(err) = last_error {
                return Err(JobError::Fetch(err));
            }
        }
        Ok(JobOutcome::Synced {
            windows: self.passes.len(),
            failed_windows,
            fetched,
            reconcile,
        })
    }
}

/// Backfill a list of derived fields in order.
pub struct RecomputeJob {
    name: String,
    fields: Vec<Arc<dyn DerivedField>>,
    engine: Arc<RecomputeEngine>,
    sink: Arc<dyn ErrorSink>,
}

impl RecomputeJob {
    pub fn new(
        name: impl Into<String>,
        fields: Vec<Arc<dyn DerivedField>>,
        engine: Arc<RecomputeEngine>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            name: name.into(),
            fields,
            engine,
            sink,
        }
    }
}

#[async_trait]
impl Job for RecomputeJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &TickContext) -> Result<JobOutcome, JobError> {
        let mut reports = Vec::new();
        let mut failed_fields = 0;
        let mut last_error = None;
        for field in &self.fields {
            match self.engine.run(Arc::clone(field), None).await {
                Ok(report) => reports.push(report),
                Err(err) => {
                    failed_fields += 1;
                    self.sink.critical(&FailureEvent::new(
                        Boundary::Job,
                        format!("{}/{}", self.name, field.qualified_name()),
                        err.to_string(),
                        true,
                    ));
                    last_error = Some(err);
                }
            }
        }
        if failed_fields > 0 && failed_fields == self.fields.len() {
            if let Some(err) = last_error {
                return Err(JobError::Storage(err));
            }
        }
        Ok(JobOutcome::Recomputed {
            reports,
            failed_fields,
        })
    }
}

fn fields(names: &[&str]) -> Vec<Arc<dyn DerivedField>> {
    names.iter().filter_map(|name| derived_field(name)).collect()
}

/// Standard tier layout: fast tiers follow transactions, slower tiers the
/// reference data, and the daily tier sweeps everything.
pub fn default_registry(
    step: SyncStep,
    recompute: Arc<RecomputeEngine>,
    scopes: Vec<Option<String>>,
    sink: Arc<dyn ErrorSink>,
) -> JobRegistry {
    let sync = |name: &str, kinds: &[EntityKind]| -> Arc<dyn Job> {
        Arc::new(WindowSyncJob::new(
            name,
            kinds.to_vec(),
            scopes.clone(),
            step.clone(),
            Arc::clone(&sink),
        ))
    };
    let backfill = |name: &str, fields: Vec<Arc<dyn DerivedField>>| -> Arc<dyn Job> {
        Arc::new(RecomputeJob::new(
            name,
            fields,
            Arc::clone(&recompute),
            Arc::clone(&sink),
        ))
    };

    let mut registry = JobRegistry::new();
    registry.register(
        CadenceTier::EveryTwoMinutes,
        sync("sync_receipts", &[EntityKind::Receipt, EntityKind::ReceiptLine]),
    );
    registry
        .register(
            CadenceTier::EveryFiveMinutes,
            sync("sync_customers", &[EntityKind::Customer]),
        )
        .register(
            CadenceTier::EveryFiveMinutes,
            backfill("recompute_line_products", fields(&["receipt_line.product_name"])),
        );
    registry
        .register(
            CadenceTier::EveryThirtyMinutes,
            sync("sync_catalogue", &[EntityKind::Product, EntityKind::Tax]),
        )
        .register(
            CadenceTier::EveryThirtyMinutes,
            backfill("recompute_receipt_stores", fields(&["receipt.store_reg_no"])),
        );
    registry
        .register(
            CadenceTier::Hourly,
            sync("sync_staff_and_stores", &[EntityKind::Employee, EntityKind::Store]),
        )
        .register(
            CadenceTier::Hourly,
            backfill(
                "recompute_totals_and_names",
                fields(&["receipt.total_minor", "customer.display_name"]),
            ),
        );
    registry
        .register(
            CadenceTier::Daily,
            sync("resync_full_day", &EntityKind::ALL[..]),
        )
        .register(CadenceTier::Daily, backfill("recompute_all", derived_fields()));
    registry
}

//! Sync pipeline: windowed fetch, reconciliation, derived-field backfill and
//! the cadence tiers that drive them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tillsync_adapters::{FixtureLedgerSource, HttpLedgerSource, LedgerSource};
use tillsync_core::IdentitySequencer;
use tillsync_storage::{FetchArchive, HttpClientConfig, HttpFetcher, LedgerStore, MemoryStore, PgStore};
use tokio_cron_scheduler::JobScheduler;
use tracing::{info, warn};

pub mod config;
pub mod ops;
pub mod orchestrator;
pub mod recompute;
pub mod reconcile;
pub mod scheduler;
pub mod sink;
pub mod window;

pub use config::{ScopeConfig, ScopeRegistry, SyncConfig};
pub use orchestrator::{
    default_registry, Job, JobError, JobOutcome, JobRegistry, JobReport, RecomputeJob,
    ScheduleOrchestrator, SyncStep, TickContext, TierReport, WindowOutcome, WindowSyncJob,
};
pub use recompute::{
    derived_field, derived_fields, partition, DerivedField, RecomputeConfig, RecomputeEngine,
    RecomputeError, RecomputeReport,
};
pub use reconcile::{ReconcileError, ReconcileReport, ReconciliationEngine, UpsertOutcome};
pub use sink::{Boundary, CollectingErrorSink, ErrorSink, FailureEvent, TracingErrorSink};
pub use window::{
    compute_window, plan_passes, split_range, ScopePass, WindowPolicy, WindowSyncEngine,
};

pub const CRATE_NAME: &str = "tillsync-sync";

/// Everything a tick needs, built once at startup and shared by reference.
pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn LedgerStore>,
    source: Arc<dyn LedgerSource>,
    sink: Arc<dyn ErrorSink>,
    sequencer: Arc<IdentitySequencer>,
    archive: Option<Arc<FetchArchive>>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LedgerStore>,
        source: Arc<dyn LedgerSource>,
    ) -> Self {
        let archive = config
            .archive_dir
            .as_ref()
            .map(|dir| Arc::new(FetchArchive::new(dir.clone())));
        Self {
            config,
            store,
            source,
            sink: Arc::new(TracingErrorSink),
            sequencer: Arc::new(IdentitySequencer::new()),
            archive,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn LedgerStore> {
        Arc::clone(&self.store)
    }

    pub fn sink(&self) -> Arc<dyn ErrorSink> {
        Arc::clone(&self.sink)
    }

    pub fn reconciler(&self) -> Arc<ReconciliationEngine> {
        Arc::new(ReconciliationEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.sequencer),
            Arc::clone(&self.sink),
        ))
    }

    pub fn sync_step(&self) -> SyncStep {
        SyncStep {
            engine: Arc::new(WindowSyncEngine::new(Arc::clone(&self.source))),
            reconciler: self.reconciler(),
            archive: self.archive.clone(),
        }
    }

    pub fn recompute_engine(&self) -> Arc<RecomputeEngine> {
        Arc::new(RecomputeEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
            RecomputeConfig {
                chunk_size: self.config.recompute_chunk_size,
                workers: self.config.recompute_workers,
            },
        ))
    }

    /// The default job registry over the scopes listed in `scopes.yaml`.
    pub fn orchestrator(&self) -> Result<ScheduleOrchestrator> {
        let registry_path = self.config.scope_registry_path();
        let scopes = ScopeRegistry::load(&registry_path)?.window_scopes();
        let registry = default_registry(
            self.sync_step(),
            self.recompute_engine(),
            scopes,
            Arc::clone(&self.sink),
        );
        Ok(ScheduleOrchestrator::new(registry, Arc::clone(&self.sink))
            .with_job_timeout(self.config.job_timeout))
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        let orchestrator = Arc::new(self.orchestrator()?);
        scheduler::maybe_build_scheduler(orchestrator, self.config.scheduler_enabled).await
    }
}

/// Postgres when `DATABASE_URL` is set, otherwise an in-memory store; the
/// fixture source when one is configured, otherwise the ledger HTTP API.
pub async fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();

    let store: Arc<dyn LedgerStore> = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, config.db_max_connections).await?;
            info!("using postgres ledger store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let source: Arc<dyn LedgerSource> = match &config.ledger_fixture {
        Some(path) => {
            let source = FixtureLedgerSource::load(path)
                .with_context(|| format!("loading ledger fixture {}", path.display()))?;
            info!(path = %path.display(), "using fixture ledger source");
            Arc::new(source)
        }
        None => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                bearer_token: config.ledger_token.clone(),
                ..HttpClientConfig::default()
            })?;
            Arc::new(HttpLedgerSource::new(config.ledger_url.clone(), http))
        }
    };

    Ok(SyncPipeline::new(config, store, source))
}

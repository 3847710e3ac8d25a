//! Retrieval windows and the fetch step of a sync job.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tillsync_adapters::{FetchedBatch, LedgerSource, SourceError};
use tillsync_core::{CadenceTier, EntityKind, SyncWindow};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// Per-cadence margins. `overlap` re-reads the tail of the previous window;
/// `lag_buffer` keeps clear of records the ledger may not have committed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub overlap: Duration,
    pub lag_buffer: Duration,
}

impl WindowPolicy {
    pub fn for_cadence(cadence_minutes: u32) -> Self {
        let (overlap_minutes, lag_seconds) = match cadence_minutes {
            0..=2 => (3, 30),
            3..=5 => (5, 30),
            6..=30 => (10, 60),
            31..=60 => (15, 120),
            _ => (120, 300),
        };
        Self {
            overlap: Duration::minutes(overlap_minutes),
            lag_buffer: Duration::seconds(lag_seconds),
        }
    }
}

/// `[now - (cadence + overlap), now - lag_buffer)`.
pub fn compute_window(cadence_minutes: u32, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let policy = WindowPolicy::for_cadence(cadence_minutes);
    let min = now - (Duration::minutes(i64::from(cadence_minutes)) + policy.overlap);
    let max = now - policy.lag_buffer;
    (min, max)
}

/// Split `[from, to)` into consecutive windows no wider than `step`.
pub fn split_range(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    step: Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut windows = Vec::new();
    if step <= Duration::zero() {
        if from < to {
            windows.push((from, to));
        }
        return windows;
    }
    let mut cursor = from;
    while cursor < to {
        let end = (cursor + step).min(to);
        windows.push((cursor, end));
        cursor = end;
    }
    windows
}

/// Kinds fetched together under one scope.
pub type ScopePass = (Option<String>, Vec<EntityKind>);

/// One fetch per store for store-partitioned kinds and a single unscoped
/// fetch for the shared catalogue. An unscoped entry in `scopes` covers every
/// kind in one pass.
pub fn plan_passes(kinds: &[EntityKind], scopes: &[Option<String>]) -> Vec<ScopePass> {
    if kinds.is_empty() {
        return Vec::new();
    }
    if scopes.is_empty() || scopes.iter().any(Option::is_none) {
        return vec![(None, kinds.to_vec())];
    }
    let (per_store, shared): (Vec<EntityKind>, Vec<EntityKind>) =
        kinds.iter().copied().partition(|k| k.is_store_scoped());
    let mut passes = Vec::new();
    if !shared.is_empty() {
        passes.push((None, shared));
    }
    if !per_store.is_empty() {
        passes.extend(scopes.iter().map(|scope| (scope.clone(), per_store.clone())));
    }
    passes
}

pub struct WindowSyncEngine {
    source: Arc<dyn LedgerSource>,
}

impl WindowSyncEngine {
    pub fn new(source: Arc<dyn LedgerSource>) -> Self {
        Self { source }
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }

    pub fn window_for(
        &self,
        tier: CadenceTier,
        now: DateTime<Utc>,
        scope: Option<String>,
    ) -> SyncWindow {
        let (min, max) = compute_window(tier.minutes(), now);
        SyncWindow {
            min,
            max,
            tier: Some(tier),
            scope,
        }
    }

    pub async fn fetch(
        &self,
        run_id: Uuid,
        kinds: &[EntityKind],
        window: &SyncWindow,
    ) -> Result<FetchedBatch, SourceError> {
        let span = info_span!(
            "window_fetch",
            %run_id,
            source = self.source.source_id(),
            min = %window.min,
            max = %window.max,
            scope = window.scope.as_deref().unwrap_or("all")
        );
        async {
            let batch = self.source.fetch_window(run_id, kinds, window).await?;
            info!(
                records = batch.records.len(),
                rejected = batch.rejected.len(),
                "window fetched"
            );
            Ok(batch)
        }
        .instrument(span)
        .await
    }
}

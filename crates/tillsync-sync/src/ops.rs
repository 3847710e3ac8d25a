//! Manual operator entry points: range resync, duplicate report, purge,
//! pending counts and targeted recompute.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tillsync_core::{find_duplicates, EntityKind, SyncWindow};
use tillsync_storage::LedgerStore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::orchestrator::SyncStep;
use crate::recompute::{derived_field, RecomputeEngine, RecomputeReport};
use crate::reconcile::ReconcileReport;
use crate::window::{plan_passes, split_range};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResyncReport {
    pub run_id: Uuid,
    pub windows: usize,
    pub failed_windows: Vec<(DateTime<Utc>, DateTime<Utc>, String)>,
    pub fetched: usize,
    pub reconcile: ReconcileReport,
}

/// Re-fetch and reconcile `[from, to)` one day at a time. A failed day is
/// recorded and the next one still runs. Catalogue kinds ignore `scope`.
pub async fn resync_range(
    step: &SyncStep,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    scope: Option<String>,
    kinds: &[EntityKind],
) -> Result<ResyncReport> {
    if from >= to {
        return Err(anyhow!("resync range is empty: {from} >= {to}"));
    }
    let kinds: Vec<EntityKind> = if kinds.is_empty() {
        EntityKind::ALL.to_vec()
    } else {
        kinds.to_vec()
    };
    let mut report = ResyncReport {
        run_id: Uuid::new_v4(),
        ..Default::default()
    };

    let passes = plan_passes(&kinds, &[scope]);
    for (min, max) in split_range(from, to, Duration::days(1)) {
        for (pass_scope, pass_kinds) in &passes {
            let window = SyncWindow::new(min, max).with_scope(pass_scope.clone());
            report.windows += 1;
            match step.sync_window(report.run_id, pass_kinds, &window).await {
                Ok(outcome) => {
                    report.fetched += outcome.fetched;
                    report.reconcile.absorb(outcome.reconcile);
                }
                Err(err) => {
                    warn!(run_id = %report.run_id, %min, %max, error = %err, "resync window failed");
                    report.failed_windows.push((min, max, err.to_string()));
                }
            }
        }
    }

    info!(
        run_id = %report.run_id,
        windows = report.windows,
        failed = report.failed_windows.len(),
        fetched = report.fetched,
        "resync finished"
    );
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateReport {
    pub kind: EntityKind,
    pub key_field: &'static str,
    pub scanned: usize,
    /// Business key to the reg_nos sharing it.
    pub duplicates: BTreeMap<String, Vec<i64>>,
}

impl DuplicateReport {
    pub fn render(&self) -> String {
        let mut out = format!(
            "{} rows scanned for duplicate {}.{}: {} duplicated keys\n",
            self.scanned,
            self.kind,
            self.key_field,
            self.duplicates.len()
        );
        for (key, reg_nos) in &self.duplicates {
            let reg_nos: Vec<String> = reg_nos.iter().map(i64::to_string).collect();
            let _ = writeln!(out, "  {key}: {}", reg_nos.join(", "));
        }
        out
    }
}

/// Rows of `kind` in `[from, to)` that share a business key.
pub async fn duplicate_report(
    store: &dyn LedgerStore,
    kind: EntityKind,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<DuplicateReport> {
    let key_field = kind.business_key_field();
    let rows = store
        .scan_range(kind, from, to)
        .await
        .with_context(|| format!("scanning {kind} rows"))?;

    let keyed: Vec<(String, i64)> = rows
        .iter()
        .filter_map(|row| {
            let key = row.fields.get(key_field)?;
            let key = key.as_str().map_or_else(|| key.to_string(), str::to_string);
            Some((key, row.reg_no))
        })
        .collect();
    let dupes = find_duplicates(keyed.iter().map(|(key, _)| key.clone()));

    let mut duplicates: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for (key, reg_no) in keyed {
        if dupes.contains(&key) {
            duplicates.entry(key).or_default().push(reg_no);
        }
    }
    Ok(DuplicateReport {
        kind,
        key_field,
        scanned: rows.len(),
        duplicates,
    })
}

/// Delete local rows whose source timestamp lies in `[from, to)`.
pub async fn purge_range(
    store: &dyn LedgerStore,
    kind: Option<EntityKind>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<u64> {
    if from >= to {
        return Err(anyhow!("purge range is empty: {from} >= {to}"));
    }
    let removed = store
        .delete_range(kind, from, to)
        .await
        .context("deleting rows")?;
    warn!(
        kind = kind.map(|k| k.as_str()).unwrap_or("all"),
        %from,
        %to,
        removed,
        "local rows purged"
    );
    Ok(removed)
}

/// Rows of a `kind.field` derived field still holding the sentinel.
pub async fn pending_count(store: &dyn LedgerStore, qualified_name: &str) -> Result<u64> {
    let field = derived_field(qualified_name)
        .ok_or_else(|| anyhow!("unknown derived field `{qualified_name}`"))?;
    let count = store
        .count_pending(field.kind(), field.name(), &field.sentinel())
        .await
        .with_context(|| format!("counting pending {qualified_name}"))?;
    Ok(count)
}

pub async fn recompute_field(
    engine: &RecomputeEngine,
    qualified_name: &str,
    only_ids: Option<&[i64]>,
) -> Result<RecomputeReport> {
    let field = derived_field(qualified_name)
        .ok_or_else(|| anyhow!("unknown derived field `{qualified_name}`"))?;
    engine
        .run(field, only_ids)
        .await
        .with_context(|| format!("recomputing {qualified_name}"))
}

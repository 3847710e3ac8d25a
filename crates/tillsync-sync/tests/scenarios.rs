use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use tillsync_adapters::{FetchedBatch, FixtureLedgerSource, LedgerSource, SourceError};
use tillsync_core::{
    CadenceTier, CustomerPayload, EntityKind, ExternalRecord, FieldMap, IdentitySequencer,
    LedgerPayload, ProductPayload, ReceiptLinePayload, ReceiptPayload, StorePayload, SyncWindow,
};
use tillsync_storage::{LedgerStore, MemoryStore};
use tillsync_sync::{
    derived_fields, Boundary, CollectingErrorSink, JobRegistry, RecomputeConfig, RecomputeEngine,
    RecomputeJob, ReconciliationEngine, ScheduleOrchestrator, SyncConfig, SyncPipeline, SyncStep,
    WindowSyncEngine, WindowSyncJob,
};
use uuid::Uuid;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).single().unwrap()
}

fn at(minutes: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(minutes)
}

fn record(external_id: &str, minutes: i64, payload: LedgerPayload) -> ExternalRecord {
    ExternalRecord {
        external_id: external_id.into(),
        source_timestamp: at(minutes),
        scope: Some("store-1".into()),
        payload,
    }
}

fn store(id: &str, minutes: i64) -> ExternalRecord {
    record(
        id,
        minutes,
        LedgerPayload::Store(StorePayload {
            name: Some(format!("Store {id}")),
            ..Default::default()
        }),
    )
}

fn product(id: &str, name: &str, minutes: i64) -> ExternalRecord {
    record(
        id,
        minutes,
        LedgerPayload::Product(ProductPayload {
            name: Some(name.into()),
            sku: Some(format!("SKU-{id}")),
            ..Default::default()
        }),
    )
}

fn customer(id: &str, name: &str, minutes: i64) -> ExternalRecord {
    record(
        id,
        minutes,
        LedgerPayload::Customer(CustomerPayload {
            name: Some(name.into()),
            ..Default::default()
        }),
    )
}

fn receipt(id: &str, store_id: &str, minutes: i64) -> ExternalRecord {
    record(
        id,
        minutes,
        LedgerPayload::Receipt(ReceiptPayload {
            receipt_number: Some(format!("N-{id}")),
            store_id: Some(store_id.into()),
            ..Default::default()
        }),
    )
}

fn line(id: &str, receipt_id: &str, product_id: &str, price: i64, minutes: i64) -> ExternalRecord {
    record(
        id,
        minutes,
        LedgerPayload::ReceiptLine(ReceiptLinePayload {
            receipt_id: receipt_id.into(),
            line_no: Some(1),
            product_id: Some(product_id.into()),
            quantity: Some(1.0),
            price_minor: Some(price),
            discount_minor: None,
        }),
    )
}

struct Harness {
    store: Arc<MemoryStore>,
    source: Arc<FixtureLedgerSource>,
    sink: Arc<CollectingErrorSink>,
    step: SyncStep,
}

fn harness(records: Vec<ExternalRecord>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(FixtureLedgerSource::new(records));
    let sink = Arc::new(CollectingErrorSink::new());
    let step = SyncStep {
        engine: Arc::new(WindowSyncEngine::new(source.clone())),
        reconciler: Arc::new(ReconciliationEngine::new(
            store.clone(),
            Arc::new(IdentitySequencer::new()),
            sink.clone(),
        )),
        archive: None,
    };
    Harness {
        store,
        source,
        sink,
        step,
    }
}

async fn rows_of(store: &MemoryStore, kind: EntityKind) -> Vec<tillsync_core::LocalRecord> {
    store
        .snapshot()
        .await
        .into_iter()
        .filter(|r| r.kind == kind)
        .collect()
}

#[tokio::test]
async fn overlapping_windows_leave_one_row_with_latest_payload() {
    let h = harness(vec![product("X", "Filter Coffee", 12)]);
    let window_a = SyncWindow::new(at(0), at(15));
    let window_b = SyncWindow::new(at(10), at(20));

    let a = h
        .step
        .sync_window(Uuid::new_v4(), &[EntityKind::Product], &window_a)
        .await
        .unwrap();
    assert_eq!(a.reconcile.created, 1);
    let reg_no = rows_of(&h.store, EntityKind::Product).await[0].reg_no;

    h.source.push(product("X", "Batch Brew", 14)).await;
    let b = h
        .step
        .sync_window(Uuid::new_v4(), &[EntityKind::Product], &window_b)
        .await
        .unwrap();
    assert_eq!(b.fetched, 2);
    assert_eq!(b.reconcile.created, 0);

    let rows = rows_of(&h.store, EntityKind::Product).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].field_str("name"), Some("Batch Brew"));
    assert_eq!(rows[0].source_timestamp, at(14));
    assert_eq!(rows[0].reg_no, reg_no);
}

#[tokio::test]
async fn line_ahead_of_header_in_same_window_is_reconciled() {
    let h = harness(vec![line("L-1", "R-1", "P-1", 300, 1), receipt("R-1", "S-1", 5)]);
    let window = SyncWindow::new(at(0), at(10));

    let outcome = h
        .step
        .sync_window(
            Uuid::new_v4(),
            &[EntityKind::Receipt, EntityKind::ReceiptLine],
            &window,
        )
        .await
        .unwrap();

    assert!(outcome.reconcile.failures.is_empty());
    assert_eq!(outcome.reconcile.created, 2);
}

#[tokio::test]
async fn orphan_line_is_retried_once_header_arrives_in_later_window() {
    let kinds = [EntityKind::Receipt, EntityKind::ReceiptLine];
    let h = harness(vec![line("L-1", "R-1", "P-1", 300, 4), receipt("R-1", "S-1", 8)]);

    let first = h
        .step
        .sync_window(Uuid::new_v4(), &kinds, &SyncWindow::new(at(0), at(6)))
        .await
        .unwrap();
    assert_eq!(first.reconcile.created, 0);
    assert_eq!(first.reconcile.failures.len(), 1);
    assert!(first.reconcile.failures[0].recoverable);
    assert_eq!(h.sink.count(Boundary::Record), 1);

    // next tick's overlap re-reads the line
    let second = h
        .step
        .sync_window(Uuid::new_v4(), &kinds, &SyncWindow::new(at(2), at(10)))
        .await
        .unwrap();
    assert!(second.reconcile.failures.is_empty());
    assert_eq!(rows_of(&h.store, EntityKind::ReceiptLine).await.len(), 1);
    assert_eq!(rows_of(&h.store, EntityKind::Receipt).await.len(), 1);
}

fn shop_records() -> Vec<ExternalRecord> {
    vec![
        store("S-1", 0),
        store("S-2", 0),
        product("P-1", "Espresso", 1),
        product("P-2", "Scone", 1),
        customer("C-1", "Ada", 2),
        receipt("R-1", "S-1", 3),
        receipt("R-2", "S-2", 3),
        receipt("R-3", "S-1", 4),
        line("L-1", "R-1", "P-1", 250, 3),
        line("L-2", "R-1", "P-2", 300, 3),
        line("L-3", "R-2", "P-2", 300, 3),
        line("L-4", "R-3", "P-1", 250, 4),
    ]
}

async fn seeded_store() -> Arc<MemoryStore> {
    let h = harness(shop_records());
    let outcome = h
        .step
        .sync_window(Uuid::new_v4(), &EntityKind::ALL, &SyncWindow::new(at(0), at(10)))
        .await
        .unwrap();
    assert!(outcome.reconcile.failures.is_empty());
    h.store
}

fn engine(store: Arc<MemoryStore>, chunk_size: usize) -> RecomputeEngine {
    RecomputeEngine::new(
        store,
        Arc::new(CollectingErrorSink::new()),
        RecomputeConfig {
            chunk_size,
            workers: 3,
        },
    )
}

/// Derived values keyed by external id, with store references expressed as
/// store external ids so separately seeded stores compare equal.
async fn derived_view(store: &MemoryStore) -> BTreeMap<String, FieldMap> {
    let rows = store.snapshot().await;
    let store_ids: BTreeMap<i64, String> = rows
        .iter()
        .filter(|r| r.kind == EntityKind::Store)
        .filter_map(|r| Some((r.reg_no, r.external_id.clone()?)))
        .collect();
    rows.into_iter()
        .filter_map(|row| {
            let mut derived = row.derived.clone();
            if let Some(reg_no) = derived.get("store_reg_no").and_then(Value::as_i64) {
                let ext = store_ids.get(&reg_no).cloned().unwrap_or_default();
                derived.insert("store_reg_no".into(), Value::from(ext));
            }
            Some((format!("{}:{}", row.kind, row.external_id?), derived))
        })
        .collect()
}

#[tokio::test]
async fn chunk_size_does_not_change_final_values() {
    let small = seeded_store().await;
    let large = seeded_store().await;

    for field in derived_fields() {
        engine(small.clone(), 1).run(field.clone(), None).await.unwrap();
        engine(large.clone(), 1000).run(field, None).await.unwrap();
    }

    let small_view = derived_view(&small).await;
    assert_eq!(small_view, derived_view(&large).await);
    assert_eq!(small_view["receipt:R-1"]["total_minor"], Value::from(550));
    assert_eq!(small_view["receipt:R-2"]["store_reg_no"], Value::from("S-2"));
    assert_eq!(small_view["receipt_line:L-3"]["product_name"], Value::from("Scone"));
}

#[tokio::test]
async fn recompute_reaches_a_fixed_point() {
    let store = seeded_store().await;
    let engine = engine(store.clone(), 2);

    for field in derived_fields() {
        let report = engine.run(field, None).await.unwrap();
        assert_eq!(report.failed_rows, 0);
    }
    let settled = store.snapshot().await;

    for field in derived_fields() {
        let report = engine.run(field.clone(), None).await.unwrap();
        assert_eq!(report.pending, 0, "{}", field.qualified_name());
        assert_eq!(report.written, 0);
    }
    assert_eq!(store.snapshot().await, settled);
}

#[tokio::test]
async fn changed_line_reopens_receipt_total() {
    let h = harness(shop_records());
    let window = SyncWindow::new(at(0), at(10));
    h.step
        .sync_window(Uuid::new_v4(), &EntityKind::ALL, &window)
        .await
        .unwrap();
    let engine = engine(h.store.clone(), 1000);
    for field in derived_fields() {
        engine.run(field, None).await.unwrap();
    }

    h.source.push(line("L-3", "R-2", "P-2", 450, 6)).await;
    h.step
        .sync_window(Uuid::new_v4(), &[EntityKind::ReceiptLine], &window)
        .await
        .unwrap();
    let total = tillsync_sync::derived_field("receipt.total_minor").unwrap();
    let pending = h
        .store
        .count_pending(EntityKind::Receipt, "total_minor", &total.sentinel())
        .await
        .unwrap();
    assert_eq!(pending, 1);

    engine.run(total, None).await.unwrap();
    let view = derived_view(&h.store).await;
    assert_eq!(view["receipt:R-2"]["total_minor"], Value::from(450));
}

struct DownSource;

#[async_trait]
impl LedgerSource for DownSource {
    fn source_id(&self) -> &str {
        "down"
    }

    async fn fetch_window(
        &self,
        _run_id: Uuid,
        _kinds: &[EntityKind],
        window: &SyncWindow,
    ) -> Result<FetchedBatch, SourceError> {
        Err(SourceError::Page {
            url: format!("http://ledger.invalid/receipts?min={}", window.min),
            message: "connection reset".into(),
        })
    }
}

#[tokio::test]
async fn failing_fetch_fails_only_its_job() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingErrorSink::new());
    let step = SyncStep {
        engine: Arc::new(WindowSyncEngine::new(Arc::new(DownSource))),
        reconciler: Arc::new(ReconciliationEngine::new(
            store.clone(),
            Arc::new(IdentitySequencer::new()),
            sink.clone(),
        )),
        archive: None,
    };
    let recompute = Arc::new(engine(store.clone(), 1000));

    let mut registry = JobRegistry::new();
    registry
        .register(
            CadenceTier::EveryTwoMinutes,
            Arc::new(WindowSyncJob::new(
                "sync_receipts",
                vec![EntityKind::Receipt],
                vec![None],
                step,
                sink.clone(),
            )),
        )
        .register(
            CadenceTier::EveryTwoMinutes,
            Arc::new(RecomputeJob::new(
                "recompute_all",
                derived_fields(),
                recompute,
                sink.clone(),
            )),
        );
    let orchestrator = ScheduleOrchestrator::new(registry, sink.clone());

    let report = orchestrator.run_tier(CadenceTier::EveryTwoMinutes).await;

    assert_eq!(report.jobs.len(), 2);
    assert!(!report.jobs[0].succeeded());
    assert!(report.jobs[1].succeeded());
    assert_eq!(sink.count(Boundary::Fetch), 1);
    assert_eq!(sink.count(Boundary::Job), 1);
}

#[tokio::test]
async fn daily_tier_syncs_archives_and_backfills() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let archive_dir = workspace.path().join("archive");
    let config = SyncConfig {
        archive_dir: Some(archive_dir.clone()),
        workspace_root: workspace.path().to_path_buf(),
        ..SyncConfig::default()
    };
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(FixtureLedgerSource::new(shop_records()));
    let sink = Arc::new(CollectingErrorSink::new());
    let pipeline = SyncPipeline::new(config, store.clone(), source).with_sink(sink.clone());
    let orchestrator = pipeline.orchestrator().unwrap();

    let report = orchestrator
        .run_tier_at(CadenceTier::Daily, at(0) + Duration::hours(2))
        .await;

    assert!(!report.skipped);
    assert_eq!(report.failed(), 0);
    assert!(sink.events().is_empty());
    assert_eq!(store.len().await, shop_records().len());
    let view = derived_view(&store).await;
    assert_eq!(view["receipt:R-3"]["store_reg_no"], Value::from("S-1"));
    assert_eq!(view["customer:C-1"]["display_name"], Value::from("Ada"));

    let archived = std::fs::read_dir(&archive_dir).unwrap().count();
    assert_eq!(archived, 1);
}

#[tokio::test]
async fn scoped_daily_tier_still_syncs_shared_catalogue() {
    let workspace = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        workspace.path().join("scopes.yaml"),
        "scopes:\n  - scope_id: store-1\n    display_name: Main Street\n",
    )
    .unwrap();
    let config = SyncConfig {
        workspace_root: workspace.path().to_path_buf(),
        ..SyncConfig::default()
    };
    let fixture = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/demo_ledger.json");
    let source = Arc::new(FixtureLedgerSource::load(fixture).unwrap());
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingErrorSink::new());
    let pipeline = SyncPipeline::new(config, store.clone(), source).with_sink(sink.clone());
    let orchestrator = pipeline.orchestrator().unwrap();

    let report = orchestrator
        .run_tier_at(CadenceTier::Daily, at(120))
        .await;

    assert_eq!(report.failed(), 0);
    assert!(sink.events().is_empty());
    assert_eq!(store.len().await, 9);
    assert_eq!(rows_of(&store, EntityKind::Product).await.len(), 2);
    assert_eq!(rows_of(&store, EntityKind::Tax).await.len(), 1);
    assert_eq!(
        store
            .count_pending(EntityKind::ReceiptLine, "product_name", &Value::from(""))
            .await
            .unwrap(),
        0
    );
    let view = derived_view(&store).await;
    assert_eq!(view["receipt_line:L-1"]["product_name"], Value::from("Flat White"));
    assert_eq!(view["receipt:R-1"]["total_minor"], Value::from(950));
}

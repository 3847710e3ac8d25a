//! Idempotent, dependency-ordered upsert of ledger records.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tillsync_adapters::{FetchedBatch, RejectedItem};
use tillsync_core::{
    DedupKey, EntityKind, ExternalRecord, IdentitySequencer, LocalRecord, NewLocalRecord,
    SequencerError, Upsertable,
};
use tillsync_storage::{LedgerStore, StorageError};
use tracing::{debug, info};

use crate::recompute::parent_fields_invalidated_by;
use crate::sink::{Boundary, ErrorSink, FailureEvent};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("parent {0} is not reconciled yet")]
    MissingParent(DedupKey),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("identity allocation failed: {0}")]
    Identity(#[from] SequencerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ReconcileError {
    /// A later window is expected to succeed without operator action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReconcileError::MissingParent(_) | ReconcileError::Storage(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpsertOutcome {
    Created { reg_no: i64 },
    Updated,
    Unchanged,
    /// An older revision than the one already stored.
    Stale,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub kind: EntityKind,
    pub external_id: Option<String>,
    pub reason: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub stale: usize,
    pub failures: Vec<RecordFailure>,
}

impl ReconcileReport {
    pub fn applied(&self) -> usize {
        self.created + self.updated + self.unchanged + self.stale
    }

    pub fn absorb(&mut self, other: ReconcileReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.stale += other.stale;
        self.failures.extend(other.failures);
    }

    fn count(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created { .. } => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
            UpsertOutcome::Stale => self.stale += 1,
        }
    }
}

/// Orders records so parents land before children and, per key, the latest
/// revision is applied last.
pub fn dependency_order(records: &mut [ExternalRecord]) {
    records.sort_by_key(|r| (r.kind().dependency_rank(), r.source_timestamp));
}

pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    sequencer: Arc<IdentitySequencer>,
    sink: Arc<dyn ErrorSink>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sequencer: Arc<IdentitySequencer>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            store,
            sequencer,
            sink,
        }
    }

    /// Reconcile decoded records and report the items the source could not
    /// decode as malformed.
    pub async fn reconcile_batch(&self, batch: FetchedBatch) -> ReconcileReport {
        let mut report = self.reconcile(batch.records).await;
        for item in batch.rejected {
            self.record_rejected(&mut report, item);
        }
        report
    }

    pub async fn reconcile(&self, mut records: Vec<ExternalRecord>) -> ReconcileReport {
        dependency_order(&mut records);
        let mut report = ReconcileReport::default();
        for record in &records {
            match self.upsert(record).await {
                Ok(outcome) => {
                    debug!(key = %record.dedup_key(), ?outcome, "record reconciled");
                    report.count(outcome);
                }
                Err(err) => {
                    let recoverable = err.is_recoverable();
                    self.sink.critical(&FailureEvent::new(
                        Boundary::Record,
                        record.dedup_key().to_string(),
                        err.to_string(),
                        recoverable,
                    ));
                    report.failures.push(RecordFailure {
                        kind: record.kind(),
                        external_id: Some(record.external_id.clone()),
                        reason: err.to_string(),
                        recoverable,
                    });
                }
            }
        }
        info!(
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            stale = report.stale,
            failed = report.failures.len(),
            "reconcile pass finished"
        );
        report
    }

    fn record_rejected(&self, report: &mut ReconcileReport, item: RejectedItem) {
        let err = ReconcileError::MalformedPayload(item.reason);
        let subject = match &item.external_id {
            Some(id) => DedupKey::new(item.kind, id.clone()).to_string(),
            None => format!("{}:<no id>", item.kind),
        };
        self.sink.critical(&FailureEvent::new(
            Boundary::Record,
            subject,
            err.to_string(),
            false,
        ));
        report.failures.push(RecordFailure {
            kind: item.kind,
            external_id: item.external_id,
            reason: err.to_string(),
            recoverable: false,
        });
    }

    pub async fn upsert(&self, record: &ExternalRecord) -> Result<UpsertOutcome, ReconcileError> {
        if record.external_id.trim().is_empty() {
            return Err(ReconcileError::MalformedPayload(
                "record has an empty external id".to_string(),
            ));
        }
        record
            .payload
            .validate()
            .map_err(ReconcileError::MalformedPayload)?;

        let parent = match record.parent_key() {
            Some(key) => match self.store.find_by_external_id(key.kind, &key.key).await? {
                Some(row) => Some(row),
                None => return Err(ReconcileError::MissingParent(key)),
            },
            None => None,
        };

        let kind = record.kind();
        let existing = self
            .store
            .find_by_external_id(kind, &record.external_id)
            .await?;
        let previous_parent = existing
            .as_ref()
            .and_then(|row| row.parent_external_id.clone());
        let outcome = match &existing {
            Some(existing) => self.merge_into(existing, record).await?,
            None => self.create(record).await?,
        };

        let invalidated = parent_fields_invalidated_by(kind);
        if invalidated.is_empty()
            || !matches!(outcome, UpsertOutcome::Created { .. } | UpsertOutcome::Updated)
        {
            return Ok(outcome);
        }
        if let Some(parent) = &parent {
            self.store.reset_derived(parent.id, invalidated).await?;
        }
        // a child moved between parents reopens the one it left as well
        if let (Some(parent_kind), Some(previous)) = (kind.parent_kind(), previous_parent) {
            if record.payload.parent_external_id() != Some(previous.as_str()) {
                let old_parent = self
                    .store
                    .find_by_external_id(parent_kind, &previous)
                    .await?;
                if let Some(old_parent) = old_parent {
                    self.store.reset_derived(old_parent.id, invalidated).await?;
                }
            }
        }
        Ok(outcome)
    }

    async fn merge_into(
        &self,
        existing: &LocalRecord,
        record: &ExternalRecord,
    ) -> Result<UpsertOutcome, ReconcileError> {
        if record.source_timestamp < existing.source_timestamp {
            return Ok(UpsertOutcome::Stale);
        }
        let Some(merged) = existing.merged_fields(&record.payload.field_map()) else {
            // same content at a later revision still moves the staleness bar
            if record.source_timestamp > existing.source_timestamp {
                self.store
                    .touch_source_timestamp(existing.id, record.source_timestamp)
                    .await?;
            }
            return Ok(UpsertOutcome::Unchanged);
        };
        self.store
            .update_fields(
                existing.id,
                &merged,
                record.payload.parent_external_id(),
                record.source_timestamp,
            )
            .await?;
        Ok(UpsertOutcome::Updated)
    }

    async fn create(&self, record: &ExternalRecord) -> Result<UpsertOutcome, ReconcileError> {
        let kind = record.kind();
        // one retry covers both unique-key races
        for attempt in 0..2 {
            let reg_no = self.sequencer.next_for(kind)?;
            let new_row = NewLocalRecord {
                reg_no,
                kind,
                external_id: Some(record.external_id.clone()),
                parent_external_id: record.payload.parent_external_id().map(str::to_string),
                fields: record.payload.field_map(),
                source_timestamp: record.source_timestamp,
            };
            match self.store.insert(new_row).await {
                Ok(row) => return Ok(UpsertOutcome::Created { reg_no: row.reg_no }),
                Err(StorageError::DuplicateExternalId { .. }) => {
                    // a concurrent firing created it first
                    if let Some(existing) = self
                        .store
                        .find_by_external_id(kind, &record.external_id)
                        .await?
                    {
                        return self.merge_into(&existing, record).await;
                    }
                }
                Err(StorageError::DuplicateRegNo { .. }) if attempt == 0 => {}
                Err(err) => return Err(err.into()),
            }
        }
        Err(ReconcileError::Storage(StorageError::DuplicateExternalId {
            kind,
            external_id: record.external_id.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingErrorSink;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::Value;
    use tillsync_core::{
        FieldMap, LedgerPayload, ProductPayload, ReceiptLinePayload, ReceiptPayload,
    };
    use tillsync_storage::MemoryStore;
    use tokio::sync::Mutex;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, minute, 0).single().unwrap()
    }

    fn product(id: &str, name: &str, minute: u32) -> ExternalRecord {
        ExternalRecord {
            external_id: id.into(),
            source_timestamp: at(minute),
            scope: None,
            payload: LedgerPayload::Product(ProductPayload {
                name: Some(name.into()),
                sku: Some(format!("SKU-{id}")),
                ..Default::default()
            }),
        }
    }

    fn receipt(id: &str, minute: u32) -> ExternalRecord {
        ExternalRecord {
            external_id: id.into(),
            source_timestamp: at(minute),
            scope: Some("store-1".into()),
            payload: LedgerPayload::Receipt(ReceiptPayload {
                receipt_number: Some(format!("N-{id}")),
                store_id: Some("store-1".into()),
                ..Default::default()
            }),
        }
    }

    fn line(id: &str, receipt_id: &str, minute: u32) -> ExternalRecord {
        ExternalRecord {
            external_id: id.into(),
            source_timestamp: at(minute),
            scope: Some("store-1".into()),
            payload: LedgerPayload::ReceiptLine(ReceiptLinePayload {
                receipt_id: receipt_id.into(),
                line_no: Some(1),
                product_id: Some("P-1".into()),
                quantity: Some(2.0),
                price_minor: Some(250),
                ..Default::default()
            }),
        }
    }

    fn engine(store: Arc<MemoryStore>) -> (ReconciliationEngine, Arc<CollectingErrorSink>) {
        let sink = Arc::new(CollectingErrorSink::new());
        (
            ReconciliationEngine::new(store, Arc::new(IdentitySequencer::new()), sink.clone()),
            sink,
        )
    }

    #[test]
    fn ordering_puts_parents_first_and_latest_last() {
        let mut records = vec![
            line("L-1", "R-1", 0),
            receipt("R-1", 5),
            product("P-1", "Later", 9),
            product("P-1", "Earlier", 1),
        ];
        dependency_order(&mut records);
        let order: Vec<_> = records
            .iter()
            .map(|r| (r.kind(), r.source_timestamp))
            .collect();
        assert_eq!(
            order,
            vec![
                (EntityKind::Product, at(1)),
                (EntityKind::Product, at(9)),
                (EntityKind::Receipt, at(5)),
                (EntityKind::ReceiptLine, at(0)),
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_deliveries_collapse_into_one_row() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _) = engine(store.clone());

        let report = engine
            .reconcile(vec![product("P-1", "Flat White", 1), product("P-1", "Flat White", 1)])
            .await;
        assert_eq!(report.created, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn reprocessing_finalized_record_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _) = engine(store.clone());

        engine.reconcile(vec![product("P-1", "Mocha", 1)]).await;
        let before = store.snapshot().await;
        let report = engine.reconcile(vec![product("P-1", "Mocha", 1)]).await;

        assert_eq!(report.unchanged, 1);
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn stale_revision_does_not_overwrite_newer_one() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _) = engine(store.clone());

        engine.reconcile(vec![product("P-1", "New name", 9)]).await;
        let report = engine.reconcile(vec![product("P-1", "Old name", 2)]).await;

        assert_eq!(report.stale, 1);
        let row = store
            .find_by_external_id(EntityKind::Product, "P-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.field_str("name"), Some("New name"));
    }

    #[tokio::test]
    async fn orphan_line_is_skipped_without_aborting_batch() {
        let store = Arc::new(MemoryStore::new());
        let (engine, sink) = engine(store.clone());

        let report = engine
            .reconcile(vec![line("L-9", "R-missing", 0), product("P-1", "Latte", 0)])
            .await;

        assert_eq!(report.created, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].recoverable);
        assert!(report.failures[0].reason.contains("receipt:R-missing"));
        assert_eq!(sink.count(Boundary::Record), 1);
    }

    #[tokio::test]
    async fn new_line_resets_parent_total() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _) = engine(store.clone());
        engine.reconcile(vec![receipt("R-1", 0)]).await;
        let parent = store
            .find_by_external_id(EntityKind::Receipt, "R-1")
            .await
            .unwrap()
            .unwrap();
        store
            .write_derived(parent.id, "total_minor", &serde_json::json!(999))
            .await
            .unwrap();

        engine.reconcile(vec![line("L-1", "R-1", 1)]).await;

        let parent = store.load(&[parent.id]).await.unwrap().remove(0);
        assert!(parent.derived_value("total_minor").is_none());
    }

    #[tokio::test]
    async fn rejected_items_are_reported_as_malformed() {
        let store = Arc::new(MemoryStore::new());
        let (engine, sink) = engine(store.clone());
        let batch = FetchedBatch {
            records: vec![],
            rejected: vec![RejectedItem {
                kind: EntityKind::Customer,
                external_id: Some("C-1".into()),
                reason: "bad updated_at".into(),
            }],
        };

        let report = engine.reconcile_batch(batch).await;
        assert_eq!(report.failures.len(), 1);
        assert!(!report.failures[0].recoverable);
        assert!(report.failures[0].reason.starts_with("malformed payload"));
        assert_eq!(sink.events()[0].subject, "customer:C-1");
    }

    async fn product_row(store: &MemoryStore, id: &str) -> LocalRecord {
        store
            .find_by_external_id(EntityKind::Product, id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn identical_newer_revision_raises_the_staleness_bar() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _) = engine(store.clone());

        engine.reconcile(vec![product("P-1", "A", 10)]).await;
        let repeat = engine.reconcile(vec![product("P-1", "A", 20)]).await;
        assert_eq!(repeat.unchanged, 1);
        assert_eq!(product_row(&store, "P-1").await.source_timestamp, at(20));

        let late = engine.reconcile(vec![product("P-1", "B", 15)]).await;
        assert_eq!(late.stale, 1);
        assert_eq!(late.updated, 0);
        let row = product_row(&store, "P-1").await;
        assert_eq!(row.field_str("name"), Some("A"));
        assert_eq!(row.source_timestamp, at(20));
    }

    #[tokio::test]
    async fn reg_no_survives_updates() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _) = engine(store.clone());

        let created = engine.reconcile(vec![product("P-1", "Latte", 1)]).await;
        assert_eq!(created.created, 1);
        let reg_no = product_row(&store, "P-1").await.reg_no;

        let updated = engine.reconcile(vec![product("P-1", "Oat Latte", 5)]).await;
        assert_eq!(updated.updated, 1);
        let row = product_row(&store, "P-1").await;
        assert_eq!(row.field_str("name"), Some("Oat Latte"));
        assert_eq!(row.reg_no, reg_no);
    }

    /// Lets another writer insert the same record between the reconciler's
    /// lookup and its insert.
    struct RacedStore {
        inner: MemoryStore,
        rival: Mutex<Option<NewLocalRecord>>,
    }

    #[async_trait]
    impl LedgerStore for RacedStore {
        async fn find_by_external_id(
            &self,
            kind: EntityKind,
            external_id: &str,
        ) -> Result<Option<LocalRecord>, StorageError> {
            self.inner.find_by_external_id(kind, external_id).await
        }

        async fn insert(&self, record: NewLocalRecord) -> Result<LocalRecord, StorageError> {
            if let Some(rival) = self.rival.lock().await.take() {
                self.inner.insert(rival).await?;
            }
            self.inner.insert(record).await
        }

        async fn update_fields(
            &self,
            id: i64,
            fields: &FieldMap,
            parent_external_id: Option<&str>,
            source_timestamp: DateTime<Utc>,
        ) -> Result<(), StorageError> {
            self.inner
                .update_fields(id, fields, parent_external_id, source_timestamp)
                .await
        }

        async fn touch_source_timestamp(
            &self,
            id: i64,
            source_timestamp: DateTime<Utc>,
        ) -> Result<(), StorageError> {
            self.inner.touch_source_timestamp(id, source_timestamp).await
        }

        async fn reset_derived(&self, id: i64, names: &[&str]) -> Result<(), StorageError> {
            self.inner.reset_derived(id, names).await
        }

        async fn pending_ids(
            &self,
            kind: EntityKind,
            field: &str,
            sentinel: &Value,
            within: Option<&[i64]>,
        ) -> Result<Vec<i64>, StorageError> {
            self.inner.pending_ids(kind, field, sentinel, within).await
        }

        async fn load(&self, ids: &[i64]) -> Result<Vec<LocalRecord>, StorageError> {
            self.inner.load(ids).await
        }

        async fn write_derived(
            &self,
            id: i64,
            field: &str,
            value: &Value,
        ) -> Result<(), StorageError> {
            self.inner.write_derived(id, field, value).await
        }

        async fn children(
            &self,
            kind: EntityKind,
            parent_external_id: &str,
        ) -> Result<Vec<LocalRecord>, StorageError> {
            self.inner.children(kind, parent_external_id).await
        }

        async fn scan_range(
            &self,
            kind: EntityKind,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<LocalRecord>, StorageError> {
            self.inner.scan_range(kind, from, to).await
        }

        async fn delete_range(
            &self,
            kind: Option<EntityKind>,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<u64, StorageError> {
            self.inner.delete_range(kind, from, to).await
        }

        async fn count_pending(
            &self,
            kind: EntityKind,
            field: &str,
            sentinel: &Value,
        ) -> Result<u64, StorageError> {
            self.inner.count_pending(kind, field, sentinel).await
        }
    }

    #[tokio::test]
    async fn insert_race_merges_into_the_winning_row() {
        let rival = product("P-1", "Rival", 1);
        let store = Arc::new(RacedStore {
            inner: MemoryStore::new(),
            rival: Mutex::new(Some(NewLocalRecord {
                reg_no: 4242,
                kind: EntityKind::Product,
                external_id: Some("P-1".into()),
                parent_external_id: None,
                fields: rival.payload.field_map(),
                source_timestamp: rival.source_timestamp,
            })),
        });
        let sink = Arc::new(CollectingErrorSink::new());
        let engine =
            ReconciliationEngine::new(store.clone(), Arc::new(IdentitySequencer::new()), sink);

        let report = engine.reconcile(vec![product("P-1", "Ours", 3)]).await;

        assert_eq!(report.created, 0);
        assert_eq!(report.updated, 1);
        assert!(report.failures.is_empty());
        assert_eq!(store.inner.len().await, 1);
        let row = product_row(&store.inner, "P-1").await;
        assert_eq!(row.reg_no, 4242);
        assert_eq!(row.field_str("name"), Some("Ours"));
    }

    #[tokio::test]
    async fn moving_a_line_reopens_both_receipt_totals() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _) = engine(store.clone());
        engine
            .reconcile(vec![receipt("R-1", 0), receipt("R-2", 0), line("L-1", "R-1", 1)])
            .await;
        let mut receipts = Vec::new();
        for id in ["R-1", "R-2"] {
            let row = store
                .find_by_external_id(EntityKind::Receipt, id)
                .await
                .unwrap()
                .unwrap();
            store
                .write_derived(row.id, "total_minor", &serde_json::json!(500))
                .await
                .unwrap();
            receipts.push(row.id);
        }

        let report = engine.reconcile(vec![line("L-1", "R-2", 4)]).await;
        assert_eq!(report.updated, 1);

        for parent in store.load(&receipts).await.unwrap() {
            assert!(parent.derived_value("total_minor").is_none());
        }
        assert!(store
            .children(EntityKind::ReceiptLine, "R-1")
            .await
            .unwrap()
            .is_empty());
        let moved = store.children(EntityKind::ReceiptLine, "R-2").await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].external_id.as_deref(), Some("L-1"));
    }
}

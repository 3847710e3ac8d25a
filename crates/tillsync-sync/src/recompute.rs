//! Chunked backfill of derived fields that still hold their sentinel value.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tillsync_core::{DedupKey, EntityKind, LocalRecord};
use tillsync_storage::{LedgerStore, StorageError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::sink::{Boundary, ErrorSink, FailureEvent};

#[derive(Debug, Error)]
pub enum RecomputeError {
    #[error("{kind} row {id} has no `{field}`")]
    MissingField {
        kind: EntityKind,
        id: i64,
        field: &'static str,
    },
    #[error("referenced {0} is not present locally")]
    MissingReference(DedupKey),
    #[error("{kind} row {id}: amount does not fit in i64 minor units")]
    AmountOverflow { kind: EntityKind, id: i64 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RecomputeError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            RecomputeError::MissingField { .. } | RecomputeError::AmountOverflow { .. }
        )
    }
}

/// A column filled in after reconciliation from the row and its neighbours.
/// `compute` must be deterministic given the current store contents.
#[async_trait]
pub trait DerivedField: Send + Sync {
    fn kind(&self) -> EntityKind;
    fn name(&self) -> &'static str;
    fn sentinel(&self) -> Value;

    async fn compute(
        &self,
        store: &dyn LedgerStore,
        row: &LocalRecord,
    ) -> Result<Value, RecomputeError>;

    fn qualified_name(&self) -> String {
        format!("{}.{}", self.kind(), self.name())
    }
}

fn required_str<'a>(
    row: &'a LocalRecord,
    field: &'static str,
) -> Result<&'a str, RecomputeError> {
    row.field_str(field)
        .filter(|v| !v.is_empty())
        .ok_or(RecomputeError::MissingField {
            kind: row.kind,
            id: row.id,
            field,
        })
}

async fn lookup(
    store: &dyn LedgerStore,
    kind: EntityKind,
    external_id: &str,
) -> Result<LocalRecord, RecomputeError> {
    store
        .find_by_external_id(kind, external_id)
        .await?
        .ok_or_else(|| RecomputeError::MissingReference(DedupKey::new(kind, external_id)))
}

/// `receipt.store_reg_no`: reg_no of the store the receipt was rung up at.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReceiptStoreRegNo;

#[async_trait]
impl DerivedField for ReceiptStoreRegNo {
    fn kind(&self) -> EntityKind {
        EntityKind::Receipt
    }

    fn name(&self) -> &'static str {
        "store_reg_no"
    }

    fn sentinel(&self) -> Value {
        Value::from(0)
    }

    async fn compute(
        &self,
        store: &dyn LedgerStore,
        row: &LocalRecord,
    ) -> Result<Value, RecomputeError> {
        let store_id = required_str(row, "store_id")?;
        let parent = lookup(store, EntityKind::Store, store_id).await?;
        Ok(Value::from(parent.reg_no))
    }
}

/// `receipt.total_minor`: sum over the receipt's lines, in minor units.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReceiptTotal;

/// `round(quantity * price) - discount`, rejecting amounts outside `i64`.
pub fn line_amount_minor(line: &LocalRecord) -> Result<i64, RecomputeError> {
    let overflow = || RecomputeError::AmountOverflow {
        kind: line.kind,
        id: line.id,
    };
    let quantity = line.field_f64("quantity").unwrap_or(1.0);
    let price = line.field_i64("price_minor").unwrap_or(0);
    let discount = line.field_i64("discount_minor").unwrap_or(0);
    let gross = (quantity * price as f64).round();
    // 2^63 is exactly representable; anything at or past it would saturate
    if !gross.is_finite() || gross >= i64::MAX as f64 || gross < i64::MIN as f64 {
        return Err(overflow());
    }
    (gross as i64).checked_sub(discount).ok_or_else(overflow)
}

#[async_trait]
impl DerivedField for ReceiptTotal {
    fn kind(&self) -> EntityKind {
        EntityKind::Receipt
    }

    fn name(&self) -> &'static str {
        "total_minor"
    }

    fn sentinel(&self) -> Value {
        Value::from(0)
    }

    async fn compute(
        &self,
        store: &dyn LedgerStore,
        row: &LocalRecord,
    ) -> Result<Value, RecomputeError> {
        let external_id = row
            .external_id
            .as_deref()
            .ok_or(RecomputeError::MissingField {
                kind: row.kind,
                id: row.id,
                field: "external_id",
            })?;
        let lines = store.children(EntityKind::ReceiptLine, external_id).await?;
        let mut total: i64 = 0;
        for line in &lines {
            total = total
                .checked_add(line_amount_minor(line)?)
                .ok_or(RecomputeError::AmountOverflow {
                    kind: row.kind,
                    id: row.id,
                })?;
        }
        Ok(Value::from(total))
    }
}

/// `receipt_line.product_name`: copied from the referenced product.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineProductName;

#[async_trait]
impl DerivedField for LineProductName {
    fn kind(&self) -> EntityKind {
        EntityKind::ReceiptLine
    }

    fn name(&self) -> &'static str {
        "product_name"
    }

    fn sentinel(&self) -> Value {
        Value::from("")
    }

    async fn compute(
        &self,
        store: &dyn LedgerStore,
        row: &LocalRecord,
    ) -> Result<Value, RecomputeError> {
        let product_id = required_str(row, "product_id")?;
        let product = lookup(store, EntityKind::Product, product_id).await?;
        Ok(Value::from(product.field_str("name").unwrap_or_default()))
    }
}

/// `customer.display_name`: name, else email, else customer code.
#[derive(Debug, Default, Clone, Copy)]
pub struct CustomerDisplayName;

#[async_trait]
impl DerivedField for CustomerDisplayName {
    fn kind(&self) -> EntityKind {
        EntityKind::Customer
    }

    fn name(&self) -> &'static str {
        "display_name"
    }

    fn sentinel(&self) -> Value {
        Value::from("")
    }

    async fn compute(
        &self,
        _store: &dyn LedgerStore,
        row: &LocalRecord,
    ) -> Result<Value, RecomputeError> {
        let label = ["name", "email", "customer_code"]
            .into_iter()
            .filter_map(|f| row.field_str(f))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .unwrap_or_default();
        Ok(Value::from(label))
    }
}

pub fn derived_fields() -> Vec<Arc<dyn DerivedField>> {
    vec![
        Arc::new(ReceiptStoreRegNo),
        Arc::new(ReceiptTotal),
        Arc::new(LineProductName),
        Arc::new(CustomerDisplayName),
    ]
}

/// Look a field up by `kind.field`, e.g. `receipt.total_minor`.
pub fn derived_field(qualified_name: &str) -> Option<Arc<dyn DerivedField>> {
    derived_fields()
        .into_iter()
        .find(|f| f.qualified_name() == qualified_name)
}

/// Derived fields of the parent row that go stale when a child of `kind` changes.
pub fn parent_fields_invalidated_by(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::ReceiptLine => &["total_minor"],
        _ => &[],
    }
}

/// Fixed-size, disjoint chunks in input order. A zero size is treated as one.
pub fn partition(ids: &[i64], chunk_size: usize) -> std::slice::Chunks<'_, i64> {
    ids.chunks(chunk_size.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecomputeConfig {
    pub chunk_size: usize,
    pub workers: usize,
}

impl Default for RecomputeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecomputeReport {
    pub field: String,
    pub pending: usize,
    pub chunks: usize,
    pub written: usize,
    /// Computed value was still the sentinel; the row stays pending.
    pub unresolved: usize,
    /// No longer pending when its chunk re-checked it.
    pub skipped: usize,
    pub failed_rows: usize,
    pub failed_chunks: usize,
}

impl RecomputeReport {
    fn absorb(&mut self, chunk: ChunkOutcome) {
        self.written += chunk.written;
        self.unresolved += chunk.unresolved;
        self.skipped += chunk.skipped;
        self.failed_rows += chunk.failed;
    }
}

#[derive(Debug, Default)]
struct ChunkOutcome {
    written: usize,
    unresolved: usize,
    skipped: usize,
    failed: usize,
}

pub struct RecomputeEngine {
    store: Arc<dyn LedgerStore>,
    sink: Arc<dyn ErrorSink>,
    config: RecomputeConfig,
}

impl RecomputeEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sink: Arc<dyn ErrorSink>,
        config: RecomputeConfig,
    ) -> Self {
        Self {
            store,
            sink,
            config,
        }
    }

    pub fn config(&self) -> RecomputeConfig {
        self.config
    }

    /// Backfill every pending row of `field`, or only those among `only_ids`.
    /// Only the initial selection can fail the run; chunk and row failures are
    /// reported to the sink and counted.
    pub async fn run(
        &self,
        field: Arc<dyn DerivedField>,
        only_ids: Option<&[i64]>,
    ) -> Result<RecomputeReport, StorageError> {
        let sentinel = field.sentinel();
        let ids = self
            .store
            .pending_ids(field.kind(), field.name(), &sentinel, only_ids)
            .await?;
        let mut report = RecomputeReport {
            field: field.qualified_name(),
            pending: ids.len(),
            ..Default::default()
        };
        if ids.is_empty() {
            debug!(field = %report.field, "nothing pending");
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();
        for chunk in partition(&ids, self.config.chunk_size) {
            let chunk = chunk.to_vec();
            let permits = Arc::clone(&permits);
            let store = Arc::clone(&self.store);
            let sink = Arc::clone(&self.sink);
            let field = Arc::clone(&field);
            report.chunks += 1;
            tasks.spawn(async move {
                let first = chunk.first().copied();
                let _permit = permits.acquire_owned().await.ok();
                let outcome = process_chunk(store.as_ref(), sink.as_ref(), field.as_ref(), &chunk).await;
                (first, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.absorb(outcome),
                Ok((first, Err(err))) => {
                    report.failed_chunks += 1;
                    self.sink.critical(&FailureEvent::new(
                        Boundary::Chunk,
                        format!("{} chunk starting at id {}", report.field, first.unwrap_or_default()),
                        err.to_string(),
                        true,
                    ));
                }
                Err(join_err) => {
                    report.failed_chunks += 1;
                    self.sink.critical(&FailureEvent::new(
                        Boundary::Chunk,
                        report.field.clone(),
                        format!("chunk task aborted: {join_err}"),
                        true,
                    ));
                }
            }
        }

        info!(
            field = %report.field,
            pending = report.pending,
            chunks = report.chunks,
            written = report.written,
            unresolved = report.unresolved,
            skipped = report.skipped,
            failed_rows = report.failed_rows,
            failed_chunks = report.failed_chunks,
            "recompute finished"
        );
        Ok(report)
    }
}

async fn process_chunk(
    store: &dyn LedgerStore,
    sink: &dyn ErrorSink,
    field: &dyn DerivedField,
    chunk: &[i64],
) -> Result<ChunkOutcome, StorageError> {
    let sentinel = field.sentinel();
    // rows may have been finished by another chunk or firing since selection
    let still_pending = store
        .pending_ids(field.kind(), field.name(), &sentinel, Some(chunk))
        .await?;
    let mut outcome = ChunkOutcome {
        skipped: chunk.len().saturating_sub(still_pending.len()),
        ..Default::default()
    };

    for row in store.load(&still_pending).await? {
        if !row.derived_is_pending(field.name(), &sentinel) {
            outcome.skipped += 1;
            continue;
        }
        let result = match field.compute(store, &row).await {
            Ok(value) if value == sentinel => {
                outcome.unresolved += 1;
                continue;
            }
            Ok(value) => store
                .write_derived(row.id, field.name(), &value)
                .await
                .map_err(RecomputeError::from),
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => outcome.written += 1,
            Err(err) => {
                outcome.failed += 1;
                sink.critical(&FailureEvent::new(
                    Boundary::Row,
                    format!("{} row {}", field.qualified_name(), row.id),
                    err.to_string(),
                    err.is_recoverable(),
                ));
            }
        }
    }
    Ok(outcome)
}

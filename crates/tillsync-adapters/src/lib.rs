//! Ledger source contract plus the HTTP and fixture implementations.
//!
//! A source answers one question: every record whose source timestamp falls
//! in `[window.min, window.max)`. Delivery is at-least-once and unordered;
//! callers must tolerate repeats and records already seen in an earlier
//! overlapping window.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tillsync_core::{
    CustomerPayload, EmployeePayload, EntityKind, ExternalRecord, LedgerPayload, ProductPayload,
    ReceiptLinePayload, ReceiptPayload, StorePayload, SyncWindow, TaxPayload,
};
use tillsync_storage::{FetchError, HttpFetcher};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tillsync-adapters";

/// Page size requested from the ledger API.
const PAGE_LIMIT: usize = 250;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("undecodable ledger page from {url}: {message}")]
    Page { url: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Fetch(err) if err.is_transient())
    }
}

/// A ledger item that arrived but could not be turned into a typed record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedItem {
    pub kind: EntityKind,
    pub external_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedBatch {
    pub records: Vec<ExternalRecord>,
    pub rejected: Vec<RejectedItem>,
}

impl FetchedBatch {
    pub fn len(&self) -> usize {
        self.records.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait LedgerSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_window(
        &self,
        run_id: Uuid,
        kinds: &[EntityKind],
        window: &SyncWindow,
    ) -> Result<FetchedBatch, SourceError>;
}

/// Ledger API path serving a kind. Lines ride inside receipts.
pub fn endpoint_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Store => "stores",
        EntityKind::Employee => "employees",
        EntityKind::Customer => "customers",
        EntityKind::Tax => "taxes",
        EntityKind::Product => "items",
        EntityKind::Receipt | EntityKind::ReceiptLine => "receipts",
    }
}

fn json_str(item: &JsonValue, key: &str) -> Option<String> {
    match item.get(key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decode_payload(kind: EntityKind, item: JsonValue) -> Result<LedgerPayload, serde_json::Error> {
    Ok(match kind {
        EntityKind::Store => LedgerPayload::Store(serde_json::from_value::<StorePayload>(item)?),
        EntityKind::Employee => {
            LedgerPayload::Employee(serde_json::from_value::<EmployeePayload>(item)?)
        }
        EntityKind::Customer => {
            LedgerPayload::Customer(serde_json::from_value::<CustomerPayload>(item)?)
        }
        EntityKind::Tax => LedgerPayload::Tax(serde_json::from_value::<TaxPayload>(item)?),
        EntityKind::Product => LedgerPayload::Product(serde_json::from_value::<ProductPayload>(item)?),
        EntityKind::Receipt => LedgerPayload::Receipt(serde_json::from_value::<ReceiptPayload>(item)?),
        EntityKind::ReceiptLine => {
            LedgerPayload::ReceiptLine(serde_json::from_value::<ReceiptLinePayload>(item)?)
        }
    })
}

/// Turn one API item into typed records. A receipt item yields the receipt
/// followed by one record per embedded line item.
pub fn decode_item(
    kind: EntityKind,
    item: &JsonValue,
    scope: Option<&str>,
    batch: &mut FetchedBatch,
) {
    let external_id = json_str(item, "id");
    let reject = |batch: &mut FetchedBatch, kind, external_id: Option<String>, reason: String| {
        batch.rejected.push(RejectedItem {
            kind,
            external_id,
            reason,
        });
    };

    let Some(id) = external_id.clone() else {
        reject(batch, kind, None, "item has no id".to_string());
        return;
    };
    let source_timestamp = match item
        .get("updated_at")
        .and_then(JsonValue::as_str)
        .map(DateTime::parse_from_rfc3339)
    {
        Some(Ok(ts)) => ts.with_timezone(&Utc),
        Some(Err(err)) => {
            reject(batch, kind, external_id, format!("bad updated_at: {err}"));
            return;
        }
        None => {
            reject(batch, kind, external_id, "item has no updated_at".to_string());
            return;
        }
    };
    let scope = json_str(item, "store_id").or_else(|| scope.map(str::to_string));

    if kind == EntityKind::Receipt || kind == EntityKind::ReceiptLine {
        if let Some(lines) = item.get("line_items").and_then(JsonValue::as_array) {
            for (idx, line) in lines.iter().enumerate() {
                let line_no = line
                    .get("line_no")
                    .and_then(JsonValue::as_u64)
                    .unwrap_or(idx as u64 + 1);
                let line_id = json_str(line, "id").unwrap_or_else(|| format!("{id}:{line_no}"));
                let mut body = line.clone();
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("receipt_id".into(), JsonValue::String(id.clone()));
                    obj.insert("line_no".into(), JsonValue::from(line_no));
                }
                match decode_payload(EntityKind::ReceiptLine, body) {
                    Ok(payload) => batch.records.push(ExternalRecord {
                        external_id: line_id,
                        source_timestamp,
                        scope: scope.clone(),
                        payload,
                    }),
                    Err(err) => reject(
                        batch,
                        EntityKind::ReceiptLine,
                        Some(line_id),
                        err.to_string(),
                    ),
                }
            }
        }
    }

    let kind = if kind == EntityKind::ReceiptLine {
        EntityKind::Receipt
    } else {
        kind
    };
    let mut body = item.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.remove("line_items");
    }
    match decode_payload(kind, body) {
        Ok(payload) => batch.records.push(ExternalRecord {
            external_id: id,
            source_timestamp,
            scope,
            payload,
        }),
        Err(err) => reject(batch, kind, external_id, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct LedgerPage {
    #[serde(default)]
    items: Vec<JsonValue>,
    #[serde(default)]
    cursor: Option<String>,
}

/// Reads the ledger's REST API, following cursors until a page comes back
/// without one.
pub struct HttpLedgerSource {
    base_url: String,
    http: HttpFetcher,
}

impl HttpLedgerSource {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    fn window_query(window: &SyncWindow, cursor: Option<&str>) -> Vec<(&'static str, String)> {
        let mut query = vec![
            (
                "updated_at_min",
                window.min.to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
            (
                "updated_at_max",
                window.max.to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        if let Some(scope) = &window.scope {
            query.push(("store_id", scope.clone()));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        query
    }

    async fn fetch_endpoint(
        &self,
        run_id: Uuid,
        endpoint: &str,
        kind: EntityKind,
        window: &SyncWindow,
        batch: &mut FetchedBatch,
    ) -> Result<(), SourceError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let query = Self::window_query(window, cursor.as_deref());
            let body = self.http.get_bytes(run_id, &url, &query).await?;
            let page: LedgerPage = serde_json::from_slice(&body).map_err(|err| SourceError::Page {
                url: url.clone(),
                message: err.to_string(),
            })?;
            pages += 1;
            for item in &page.items {
                decode_item(kind, item, window.scope.as_deref(), batch);
            }
            match page.cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }
        debug!(endpoint, pages, "ledger endpoint drained");
        Ok(())
    }
}

#[async_trait]
impl LedgerSource for HttpLedgerSource {
    fn source_id(&self) -> &str {
        "ledger-http"
    }

    async fn fetch_window(
        &self,
        run_id: Uuid,
        kinds: &[EntityKind],
        window: &SyncWindow,
    ) -> Result<FetchedBatch, SourceError> {
        let mut batch = FetchedBatch::default();
        let mut drained = BTreeSet::new();
        for kind in kinds {
            let endpoint = endpoint_for(*kind);
            if !drained.insert(endpoint) {
                continue;
            }
            self.fetch_endpoint(run_id, endpoint, *kind, window, &mut batch)
                .await?;
        }
        batch.records.retain(|r| kinds.contains(&r.kind()));
        batch.rejected.retain(|r| kinds.contains(&r.kind));
        Ok(batch)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    records: Vec<ExternalRecord>,
}

/// In-process ledger backed by a fixed record list, used for replays,
/// demos and tests. Filters exactly like the real API would.
#[derive(Debug, Default)]
pub struct FixtureLedgerSource {
    records: RwLock<Vec<ExternalRecord>>,
}

impl FixtureLedgerSource {
    pub fn new(records: Vec<ExternalRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Reads `{"records": [...]}` from disk.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: FixtureFile =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(file.records))
    }

    /// Publish more records, e.g. a later revision of one already served.
    pub async fn push(&self, record: ExternalRecord) {
        self.records.write().await.push(record);
    }
}

#[async_trait]
impl LedgerSource for FixtureLedgerSource {
    fn source_id(&self) -> &str {
        "ledger-fixture"
    }

    async fn fetch_window(
        &self,
        _run_id: Uuid,
        kinds: &[EntityKind],
        window: &SyncWindow,
    ) -> Result<FetchedBatch, SourceError> {
        let records = self.records.read().await;
        let matching: Vec<ExternalRecord> = records
            .iter()
            .filter(|r| kinds.contains(&r.kind()))
            .filter(|r| window.contains(r.source_timestamp))
            // unscoped records belong to every store
            .filter(|r| match (&window.scope, &r.scope) {
                (Some(wanted), Some(scope)) => wanted == scope,
                _ => true,
            })
            .cloned()
            .collect();
        if matching.is_empty() {
            warn!(min = %window.min, max = %window.max, "fixture window is empty");
        }
        Ok(FetchedBatch {
            records: matching,
            rejected: Vec::new(),
        })
    }
}

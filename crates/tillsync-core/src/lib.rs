//! Core domain model for tillsync: entity kinds, typed ledger payloads,
//! local records, cadence tiers and sync windows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod duplicates;
pub mod identity;

pub use duplicates::find_duplicates;
pub use identity::{IdentitySequencer, Resolution, SequencerError};

pub const CRATE_NAME: &str = "tillsync-core";

/// Column-name to JSON value mapping used for both source fields and derived fields.
pub type FieldMap = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Store,
    Employee,
    Customer,
    Tax,
    Product,
    Receipt,
    ReceiptLine,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Store,
        EntityKind::Employee,
        EntityKind::Customer,
        EntityKind::Tax,
        EntityKind::Product,
        EntityKind::Receipt,
        EntityKind::ReceiptLine,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Store => "store",
            EntityKind::Employee => "employee",
            EntityKind::Customer => "customer",
            EntityKind::Tax => "tax",
            EntityKind::Product => "product",
            EntityKind::Receipt => "receipt",
            EntityKind::ReceiptLine => "receipt_line",
        }
    }

    /// Numeric namespace fed into the identity sequencer.
    pub fn discriminant(self) -> u32 {
        match self {
            EntityKind::Store => 1,
            EntityKind::Employee => 2,
            EntityKind::Customer => 3,
            EntityKind::Tax => 4,
            EntityKind::Product => 5,
            EntityKind::Receipt => 6,
            EntityKind::ReceiptLine => 7,
        }
    }

    /// Reference entities sort first, transaction headers next, lines last.
    pub fn dependency_rank(self) -> u8 {
        match self {
            EntityKind::Store
            | EntityKind::Employee
            | EntityKind::Customer
            | EntityKind::Tax
            | EntityKind::Product => 0,
            EntityKind::Receipt => 1,
            EntityKind::ReceiptLine => 2,
        }
    }

    /// Kinds the ledger partitions by store. Products and taxes form one
    /// catalogue shared by every store.
    pub fn is_store_scoped(self) -> bool {
        !matches!(self, EntityKind::Product | EntityKind::Tax)
    }

    pub fn parent_kind(self) -> Option<EntityKind> {
        match self {
            EntityKind::ReceiptLine => Some(EntityKind::Receipt),
            _ => None,
        }
    }

    /// Field holding the human-facing business key, used by duplicate reports.
    pub fn business_key_field(self) -> &'static str {
        match self {
            EntityKind::Store | EntityKind::Tax => "name",
            EntityKind::Employee | EntityKind::Customer => "email",
            EntityKind::Product => "sku",
            EntityKind::Receipt => "receipt_number",
            EntityKind::ReceiptLine => "line_key",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown entity kind `{s}`"))
    }
}

/// Upsert key: a kind plus either the ledger's external id or a business key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub kind: EntityKind,
    pub key: String,
}

impl DedupKey {
    pub fn new(kind: EntityKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// Capability shared by every typed ledger payload.
pub trait Upsertable {
    fn kind(&self) -> EntityKind;

    /// External id of the container this record belongs to, if any.
    fn parent_external_id(&self) -> Option<&str> {
        None
    }

    /// Structural checks beyond what decoding already guarantees.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Non-null fields of the payload, keyed by local column name.
    fn field_map(&self) -> FieldMap;
}

fn non_null_fields<T: Serialize>(payload: &T) -> FieldMap {
    match serde_json::to_value(payload) {
        Ok(Value::Object(map)) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        _ => FieldMap::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorePayload {
    pub name: Option<String>,
    pub address: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmployeePayload {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub store_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomerPayload {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub customer_code: Option<String>,
    pub total_points: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxPayload {
    pub name: Option<String>,
    pub rate: Option<f64>,
    pub tax_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductPayload {
    pub name: Option<String>,
    pub sku: Option<String>,
    pub category_id: Option<String>,
    pub price_minor: Option<i64>,
    pub tax_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptPayload {
    pub receipt_number: Option<String>,
    pub receipt_type: Option<String>,
    pub store_id: Option<String>,
    pub employee_id: Option<String>,
    pub customer_id: Option<String>,
    pub receipt_date: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptLinePayload {
    pub receipt_id: String,
    pub line_no: Option<u32>,
    pub product_id: Option<String>,
    pub quantity: Option<f64>,
    pub price_minor: Option<i64>,
    pub discount_minor: Option<i64>,
}

impl Upsertable for StorePayload {
    fn kind(&self) -> EntityKind {
        EntityKind::Store
    }

    fn field_map(&self) -> FieldMap {
        non_null_fields(self)
    }
}

impl Upsertable for EmployeePayload {
    fn kind(&self) -> EntityKind {
        EntityKind::Employee
    }

    fn field_map(&self) -> FieldMap {
        non_null_fields(self)
    }
}

impl Upsertable for CustomerPayload {
    fn kind(&self) -> EntityKind {
        EntityKind::Customer
    }

    fn field_map(&self) -> FieldMap {
        non_null_fields(self)
    }
}

impl Upsertable for TaxPayload {
    fn kind(&self) -> EntityKind {
        EntityKind::Tax
    }

    fn validate(&self) -> Result<(), String> {
        match self.rate {
            Some(rate) if !(0.0..=100.0).contains(&rate) => {
                Err(format!("tax rate {rate} outside 0..=100"))
            }
            _ => Ok(()),
        }
    }

    fn field_map(&self) -> FieldMap {
        non_null_fields(self)
    }
}

impl Upsertable for ProductPayload {
    fn kind(&self) -> EntityKind {
        EntityKind::Product
    }

    fn validate(&self) -> Result<(), String> {
        match self.price_minor {
            Some(price) if price < 0 => Err(format!("negative product price {price}")),
            _ => Ok(()),
        }
    }

    fn field_map(&self) -> FieldMap {
        non_null_fields(self)
    }
}

impl Upsertable for ReceiptPayload {
    fn kind(&self) -> EntityKind {
        EntityKind::Receipt
    }

    fn field_map(&self) -> FieldMap {
        non_null_fields(self)
    }
}

impl Upsertable for ReceiptLinePayload {
    fn kind(&self) -> EntityKind {
        EntityKind::ReceiptLine
    }

    fn parent_external_id(&self) -> Option<&str> {
        Some(self.receipt_id.as_str())
    }

    fn validate(&self) -> Result<(), String> {
        if self.receipt_id.trim().is_empty() {
            return Err("line has no receipt_id".to_string());
        }
        if let Some(qty) = self.quantity {
            if !qty.is_finite() {
                return Err("line quantity is not a finite number".to_string());
            }
        }
        Ok(())
    }

    fn field_map(&self) -> FieldMap {
        let mut fields = non_null_fields(self);
        if let Some(line_no) = self.line_no {
            fields.insert(
                "line_key".to_string(),
                Value::String(format!("{}#{}", self.receipt_id, line_no)),
            );
        }
        fields
    }
}

/// One variant per ledger entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerPayload {
    Store(StorePayload),
    Employee(EmployeePayload),
    Customer(CustomerPayload),
    Tax(TaxPayload),
    Product(ProductPayload),
    Receipt(ReceiptPayload),
    ReceiptLine(ReceiptLinePayload),
}

impl LedgerPayload {
    fn as_upsertable(&self) -> &dyn Upsertable {
        match self {
            LedgerPayload::Store(p) => p,
            LedgerPayload::Employee(p) => p,
            LedgerPayload::Customer(p) => p,
            LedgerPayload::Tax(p) => p,
            LedgerPayload::Product(p) => p,
            LedgerPayload::Receipt(p) => p,
            LedgerPayload::ReceiptLine(p) => p,
        }
    }
}

impl Upsertable for LedgerPayload {
    fn kind(&self) -> EntityKind {
        self.as_upsertable().kind()
    }

    fn parent_external_id(&self) -> Option<&str> {
        self.as_upsertable().parent_external_id()
    }

    fn validate(&self) -> Result<(), String> {
        self.as_upsertable().validate()
    }

    fn field_map(&self) -> FieldMap {
        self.as_upsertable().field_map()
    }
}

/// A record as delivered by the external ledger. Ephemeral: produced and
/// consumed within one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub external_id: String,
    pub source_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub scope: Option<String>,
    pub payload: LedgerPayload,
}

impl ExternalRecord {
    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.kind(), self.external_id.clone())
    }

    pub fn parent_key(&self) -> Option<DedupKey> {
        let parent_kind = self.kind().parent_kind()?;
        self.payload
            .parent_external_id()
            .map(|id| DedupKey::new(parent_kind, id))
    }
}

/// Locally persisted counterpart of an external record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: i64,
    pub reg_no: i64,
    pub kind: EntityKind,
    pub external_id: Option<String>,
    pub parent_external_id: Option<String>,
    pub fields: FieldMap,
    pub derived: FieldMap,
    pub source_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalRecord {
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn field_i64(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_i64)
    }

    pub fn field_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }

    pub fn derived_value(&self, name: &str) -> Option<&Value> {
        self.derived.get(name)
    }

    /// True when the derived field is absent or still holds its sentinel.
    pub fn derived_is_pending(&self, name: &str, sentinel: &Value) -> bool {
        self.derived.get(name).map_or(true, |v| v == sentinel)
    }

    /// Merge incoming non-null fields over the stored ones. Returns `None`
    /// when nothing would change.
    pub fn merged_fields(&self, incoming: &FieldMap) -> Option<FieldMap> {
        let mut merged = self.fields.clone();
        let mut changed = false;
        for (name, value) in incoming {
            if value.is_null() {
                continue;
            }
            if merged.get(name) != Some(value) {
                merged.insert(name.clone(), value.clone());
                changed = true;
            }
        }
        changed.then_some(merged)
    }
}

/// Insert request for a record seen for the first time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLocalRecord {
    pub reg_no: i64,
    pub kind: EntityKind,
    pub external_id: Option<String>,
    pub parent_external_id: Option<String>,
    pub fields: FieldMap,
    pub source_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CadenceTier {
    EveryTwoMinutes,
    EveryFiveMinutes,
    EveryThirtyMinutes,
    Hourly,
    Daily,
}

impl CadenceTier {
    pub const ALL: [CadenceTier; 5] = [
        CadenceTier::EveryTwoMinutes,
        CadenceTier::EveryFiveMinutes,
        CadenceTier::EveryThirtyMinutes,
        CadenceTier::Hourly,
        CadenceTier::Daily,
    ];

    pub fn minutes(self) -> u32 {
        match self {
            CadenceTier::EveryTwoMinutes => 2,
            CadenceTier::EveryFiveMinutes => 5,
            CadenceTier::EveryThirtyMinutes => 30,
            CadenceTier::Hourly => 60,
            CadenceTier::Daily => 1440,
        }
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        CadenceTier::ALL.into_iter().find(|t| t.minutes() == minutes)
    }
}

impl fmt::Display for CadenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.minutes())
    }
}

/// Half-open retrieval window `[min, max)`. Built per tick, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
    pub tier: Option<CadenceTier>,
    pub scope: Option<String>,
}

impl SyncWindow {
    pub fn new(min: DateTime<Utc>, max: DateTime<Utc>) -> Self {
        Self {
            min,
            max,
            tier: None,
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.min <= ts && ts < self.max
    }

    pub fn span(&self) -> Duration {
        self.max - self.min
    }
}

//! Local persistence, raw fetch archive and HTTP fetch utilities for tillsync.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tillsync_core::{EntityKind, FieldMap, LocalRecord, NewLocalRecord};

mod archive;
mod http;
mod memory;
mod postgres;

pub use archive::{ArchivedBatch, FetchArchive};
pub use http::{FetchError, HttpClientConfig, HttpFetcher};
pub use memory::MemoryStore;
pub use postgres::{pending_predicate, PgStore};

pub const CRATE_NAME: &str = "tillsync-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{kind} record with external id {external_id} already exists")]
    DuplicateExternalId {
        kind: EntityKind,
        external_id: String,
    },
    #[error("reg_no {reg_no} is already issued for {kind}")]
    DuplicateRegNo { kind: EntityKind, reg_no: i64 },
    #[error("record id {0} not found")]
    NotFound(i64),
    #[error("stored row is invalid: {0}")]
    InvalidRow(String),
    #[error("`{0}` is not a valid derived field name")]
    InvalidField(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Access patterns the sync and recompute engines need from the relational
/// store. Every mutation touches exactly one row.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_by_external_id(
        &self,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<Option<LocalRecord>, StorageError>;

    /// Fails with `DuplicateExternalId` or `DuplicateRegNo` when a unique key
    /// is already taken.
    async fn insert(&self, record: NewLocalRecord) -> Result<LocalRecord, StorageError>;

    /// Replaces the source fields and parent reference and clears every
    /// derived field of the row.
    async fn update_fields(
        &self,
        id: i64,
        fields: &FieldMap,
        parent_external_id: Option<&str>,
        source_timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Moves the stored source timestamp forward to `source_timestamp`
    /// without touching fields or derived values. Never moves it back.
    async fn touch_source_timestamp(
        &self,
        id: i64,
        source_timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Drops the named derived fields so the row reads as pending again.
    async fn reset_derived(&self, id: i64, names: &[&str]) -> Result<(), StorageError>;

    /// Ids of `kind` rows whose `field` is missing or equal to `sentinel`,
    /// optionally restricted to `within`. Ascending id order.
    async fn pending_ids(
        &self,
        kind: EntityKind,
        field: &str,
        sentinel: &Value,
        within: Option<&[i64]>,
    ) -> Result<Vec<i64>, StorageError>;

    async fn load(&self, ids: &[i64]) -> Result<Vec<LocalRecord>, StorageError>;

    async fn write_derived(&self, id: i64, field: &str, value: &Value)
        -> Result<(), StorageError>;

    async fn children(
        &self,
        kind: EntityKind,
        parent_external_id: &str,
    ) -> Result<Vec<LocalRecord>, StorageError>;

    /// Rows of `kind` whose source timestamp lies in `[from, to)`.
    async fn scan_range(
        &self,
        kind: EntityKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LocalRecord>, StorageError>;

    /// Deletes rows whose source timestamp lies in `[from, to)`; all kinds
    /// when `kind` is `None`. Returns the number of rows removed.
    async fn delete_range(
        &self,
        kind: Option<EntityKind>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    async fn count_pending(
        &self,
        kind: EntityKind,
        field: &str,
        sentinel: &Value,
    ) -> Result<u64, StorageError>;
}

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tillsync_core::{EntityKind, FieldMap, LocalRecord, NewLocalRecord};
use tokio::sync::Mutex;

use crate::{LedgerStore, StorageError};

/// Process-local store with the same unique-key rules as the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: BTreeMap<i64, LocalRecord>,
    by_external_id: HashMap<(EntityKind, String), i64>,
    reg_nos: HashSet<(EntityKind, i64)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every row in id order.
    pub async fn snapshot(&self) -> Vec<LocalRecord> {
        self.state.lock().await.rows.values().cloned().collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn find_by_external_id(
        &self,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<Option<LocalRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .by_external_id
            .get(&(kind, external_id.to_string()))
            .and_then(|id| state.rows.get(id))
            .cloned())
    }

    async fn insert(&self, record: NewLocalRecord) -> Result<LocalRecord, StorageError> {
        let mut state = self.state.lock().await;
        if let Some(external_id) = &record.external_id {
            if state
                .by_external_id
                .contains_key(&(record.kind, external_id.clone()))
            {
                return Err(StorageError::DuplicateExternalId {
                    kind: record.kind,
                    external_id: external_id.clone(),
                });
            }
        }
        if !state.reg_nos.insert((record.kind, record.reg_no)) {
            return Err(StorageError::DuplicateRegNo {
                kind: record.kind,
                reg_no: record.reg_no,
            });
        }

        state.next_id += 1;
        let now = Utc::now();
        let row = LocalRecord {
            id: state.next_id,
            reg_no: record.reg_no,
            kind: record.kind,
            external_id: record.external_id,
            parent_external_id: record.parent_external_id,
            fields: record.fields,
            derived: FieldMap::new(),
            source_timestamp: record.source_timestamp,
            created_at: now,
            updated_at: now,
        };
        if let Some(external_id) = &row.external_id {
            state
                .by_external_id
                .insert((row.kind, external_id.clone()), row.id);
        }
        state.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_fields(
        &self,
        id: i64,
        fields: &FieldMap,
        parent_external_id: Option<&str>,
        source_timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let row = state.rows.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        row.fields = fields.clone();
        row.parent_external_id = parent_external_id.map(str::to_string);
        row.derived.clear();
        row.source_timestamp = source_timestamp;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_source_timestamp(
        &self,
        id: i64,
        source_timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let row = state.rows.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        if source_timestamp > row.source_timestamp {
            row.source_timestamp = source_timestamp;
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset_derived(&self, id: i64, names: &[&str]) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let row = state.rows.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        for name in names {
            row.derived.remove(*name);
        }
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn pending_ids(
        &self,
        kind: EntityKind,
        field: &str,
        sentinel: &Value,
        within: Option<&[i64]>,
    ) -> Result<Vec<i64>, StorageError> {
        let state = self.state.lock().await;
        let allowed: Option<HashSet<i64>> = within.map(|ids| ids.iter().copied().collect());
        Ok(state
            .rows
            .values()
            .filter(|row| row.kind == kind && row.derived_is_pending(field, sentinel))
            .filter(|row| allowed.as_ref().map_or(true, |ids| ids.contains(&row.id)))
            .map(|row| row.id)
            .collect())
    }

    async fn load(&self, ids: &[i64]) -> Result<Vec<LocalRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.rows.get(id))
            .cloned()
            .collect())
    }

    async fn write_derived(
        &self,
        id: i64,
        field: &str,
        value: &Value,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let row = state.rows.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        row.derived.insert(field.to_string(), value.clone());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn children(
        &self,
        kind: EntityKind,
        parent_external_id: &str,
    ) -> Result<Vec<LocalRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|row| {
                row.kind == kind && row.parent_external_id.as_deref() == Some(parent_external_id)
            })
            .cloned()
            .collect())
    }

    async fn scan_range(
        &self,
        kind: EntityKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LocalRecord>, StorageError> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .rows
            .values()
            .filter(|row| row.kind == kind && from <= row.source_timestamp && row.source_timestamp < to)
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.source_timestamp, row.id));
        Ok(rows)
    }

    async fn delete_range(
        &self,
        kind: Option<EntityKind>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        let doomed: Vec<LocalRecord> = state
            .rows
            .values()
            .filter(|row| kind.map_or(true, |k| row.kind == k))
            .filter(|row| from <= row.source_timestamp && row.source_timestamp < to)
            .cloned()
            .collect();
        for row in &doomed {
            state.rows.remove(&row.id);
            state.reg_nos.remove(&(row.kind, row.reg_no));
            if let Some(external_id) = &row.external_id {
                state.by_external_id.remove(&(row.kind, external_id.clone()));
            }
        }
        Ok(doomed.len() as u64)
    }

    async fn count_pending(
        &self,
        kind: EntityKind,
        field: &str,
        sentinel: &Value,
    ) -> Result<u64, StorageError> {
        Ok(self.pending_ids(kind, field, sentinel, None).await?.len() as u64)
    }
}

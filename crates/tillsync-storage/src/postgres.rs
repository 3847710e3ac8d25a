use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tillsync_core::{EntityKind, FieldMap, LocalRecord, NewLocalRecord};
use tracing::info;

use crate::{LedgerStore, StorageError};

const SELECT_COLUMNS: &str = r#"
    SELECT id, reg_no, kind, external_id, parent_external_id, fields, derived,
           source_timestamp, created_at, updated_at
      FROM ledger_records
"#;

const EXTERNAL_ID_INDEX: &str = "ledger_records_kind_external_id_key";
const REG_NO_INDEX: &str = "ledger_records_kind_reg_no_key";

/// `LedgerStore` backed by the `ledger_records` Postgres table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running ledger migrations")?;
        info!("ledger migrations applied");
        Ok(())
    }
}

fn row_to_record(row: &PgRow) -> Result<LocalRecord, StorageError> {
    let kind: String = row.try_get("kind")?;
    let kind = kind.parse::<EntityKind>().map_err(StorageError::InvalidRow)?;
    let fields: Json<FieldMap> = row.try_get("fields")?;
    let derived: Json<FieldMap> = row.try_get("derived")?;
    Ok(LocalRecord {
        id: row.try_get("id")?,
        reg_no: row.try_get("reg_no")?,
        kind,
        external_id: row.try_get("external_id")?,
        parent_external_id: row.try_get("parent_external_id")?,
        fields: fields.0,
        derived: derived.0,
        source_timestamp: row.try_get("source_timestamp")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn rows_to_records(rows: &[PgRow]) -> Result<Vec<LocalRecord>, StorageError> {
    rows.iter().map(row_to_record).collect()
}

fn map_insert_error(err: sqlx::Error, record: &NewLocalRecord) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            match db.constraint() {
                Some(REG_NO_INDEX) => {
                    return StorageError::DuplicateRegNo {
                        kind: record.kind,
                        reg_no: record.reg_no,
                    }
                }
                Some(EXTERNAL_ID_INDEX) | None => {
                    return StorageError::DuplicateExternalId {
                        kind: record.kind,
                        external_id: record.external_id.clone().unwrap_or_default(),
                    }
                }
                Some(_) => {}
            }
        }
    }
    StorageError::Database(err)
}

/// Rows of `kind` whose derived `field` is missing or equal to `sentinel`.
/// Rendered with literals rather than binds so the planner can match it to
/// the per-field partial indexes of the pending-scan migration.
pub fn pending_predicate(
    kind: EntityKind,
    field: &str,
    sentinel: &Value,
) -> Result<String, StorageError> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
        return Err(StorageError::InvalidField(field.to_string()));
    }
    let sentinel = sentinel.to_string().replace('\'', "''");
    Ok(format!(
        "kind = '{kind}' AND COALESCE(derived -> '{field}', '{sentinel}'::jsonb) = '{sentinel}'::jsonb"
    ))
}

fn expect_one(id: i64, rows_affected: u64) -> Result<(), StorageError> {
    if rows_affected == 0 {
        Err(StorageError::NotFound(id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn find_by_external_id(
        &self,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<Option<LocalRecord>, StorageError> {
        let sql = format!("{SELECT_COLUMNS} WHERE kind = $1 AND external_id = $2");
        let row = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn insert(&self, record: NewLocalRecord) -> Result<LocalRecord, StorageError> {
        let sql = r#"
            INSERT INTO ledger_records
                (reg_no, kind, external_id, parent_external_id, fields, source_timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, reg_no, kind, external_id, parent_external_id, fields, derived,
                      source_timestamp, created_at, updated_at
        "#;
        let row = sqlx::query(sql)
            .bind(record.reg_no)
            .bind(record.kind.as_str())
            .bind(record.external_id.as_deref())
            .bind(record.parent_external_id.as_deref())
            .bind(Json(&record.fields))
            .bind(record.source_timestamp)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_insert_error(err, &record))?;
        row_to_record(&row)
    }

    async fn update_fields(
        &self,
        id: i64,
        fields: &FieldMap,
        parent_external_id: Option<&str>,
        source_timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_records
               SET fields = $2,
                   parent_external_id = $3,
                   derived = '{}'::jsonb,
                   source_timestamp = $4,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(fields))
        .bind(parent_external_id)
        .bind(source_timestamp)
        .execute(&self.pool)
        .await?;
        expect_one(id, result.rows_affected())
    }

    async fn touch_source_timestamp(
        &self,
        id: i64,
        source_timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_records
               SET source_timestamp = GREATEST(source_timestamp, $2),
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(source_timestamp)
        .execute(&self.pool)
        .await?;
        expect_one(id, result.rows_affected())
    }

    async fn reset_derived(&self, id: i64, names: &[&str]) -> Result<(), StorageError> {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE ledger_records
               SET derived = derived - $2::text[],
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&names)
        .execute(&self.pool)
        .await?;
        expect_one(id, result.rows_affected())
    }

    async fn pending_ids(
        &self,
        kind: EntityKind,
        field: &str,
        sentinel: &Value,
        within: Option<&[i64]>,
    ) -> Result<Vec<i64>, StorageError> {
        let within: Option<Vec<i64>> = within.map(|ids| ids.to_vec());
        let sql = format!(
            "SELECT id FROM ledger_records WHERE {} \
             AND ($1::BIGINT[] IS NULL OR id = ANY($1)) ORDER BY id",
            pending_predicate(kind, field, sentinel)?
        );
        let ids = sqlx::query_scalar::<_, i64>(&sql)
            .bind(within)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn load(&self, ids: &[i64]) -> Result<Vec<LocalRecord>, StorageError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ANY($1) ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows_to_records(&rows)
    }

    async fn write_derived(
        &self,
        id: i64,
        field: &str,
        value: &Value,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_records
               SET derived = jsonb_set(derived, ARRAY[$2::text], $3, true),
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(field)
        .bind(Json(value))
        .execute(&self.pool)
        .await?;
        expect_one(id, result.rows_affected())
    }

    async fn children(
        &self,
        kind: EntityKind,
        parent_external_id: &str,
    ) -> Result<Vec<LocalRecord>, StorageError> {
        let sql = format!("{SELECT_COLUMNS} WHERE kind = $1 AND parent_external_id = $2 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(parent_external_id)
            .fetch_all(&self.pool)
            .await?;
        rows_to_records(&rows)
    }

    async fn scan_range(
        &self,
        kind: EntityKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LocalRecord>, StorageError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE kind = $1 AND source_timestamp >= $2 AND source_timestamp < $3 \
             ORDER BY source_timestamp, id"
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        rows_to_records(&rows)
    }

    async fn delete_range(
        &self,
        kind: Option<EntityKind>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM ledger_records
             WHERE ($1::TEXT IS NULL OR kind = $1)
               AND source_timestamp >= $2
               AND source_timestamp < $3
            "#,
        )
        .bind(kind.map(EntityKind::as_str))
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_pending(
        &self,
        kind: EntityKind,
        field: &str,
        sentinel: &Value,
    ) -> Result<u64, StorageError> {
        let sql = format!(
            "SELECT COUNT(*) FROM ledger_records WHERE {}",
            pending_predicate(kind, field, sentinel)?
        );
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

//! Postgres implementation of [`SinkStore`] and the schema derived from the
//! field registry.

use std::collections::HashSet;

use async_trait::async_trait;
use rupsync_core::{
    EnrichmentRecord, FieldMapping, NaturalKey, OrderedDataset, ENRICHMENT_SOURCE,
    ENRICHMENT_TABLE, KEY_CODE_FIELD, KEY_NAME_FIELD, MAPPINGS,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Acquire, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};

use crate::store::{
    CycleTransaction, Page, SinkStore, StoreError, SyncRunRecord, UpsertStamp,
};

const BOOKKEEPING_COLUMNS: &[&str] = &["active_year", "last_update"];

/// Enrichment-only columns, in bind order.
const DETAIL_COLUMNS: &[&str] = &[
    "nama_klpd",
    "tahun_anggaran",
    "total_pagu",
    "sumber_dana_list",
    "lokasi_pekerjaan",
    "pemanfaatan_mulai",
    "pemanfaatan_akhir",
    "jadwal_kontrak_mulai",
    "jadwal_kontrak_akhir",
    "jadwal_pemilihan_mulai",
    "jadwal_pemilihan_akhir",
    "tanggal_umumkan_paket",
    "tanggal_lain",
    "extraction_succeeded",
];

#[derive(Clone)]
pub struct PgSinkStore {
    pool: PgPool,
}

impl PgSinkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Creates every sink table, the enrichment table and `sync_runs` when
    /// missing. Safe to run repeatedly.
    pub async fn ensure_schema(&self) -> Result<usize, StoreError> {
        let statements = schema_statements();
        let mut tx = self.pool.begin().await?;
        for statement in &statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!(statements = statements.len(), "schema ensured");
        Ok(statements.len())
    }
}

fn checked_table(table_name: &str) -> Result<&str, StoreError> {
    let known = table_name == ENRICHMENT_TABLE
        || MAPPINGS.iter().any(|m| m.table_name == table_name);
    if known {
        Ok(table_name)
    } else {
        Err(StoreError::NoSchema(table_name.to_string()))
    }
}

/// `INSERT .. ON CONFLICT (kode_rup, nama_paket) DO UPDATE`. A conflicting
/// row is always revived.
pub fn upsert_statement(table: &str, columns: &[&str], updates: &[&str]) -> String {
    let placeholders = (1..=columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sets = updates
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>();
    sets.push("deleted_at = NULL".to_string());
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders}) \
         ON CONFLICT ({KEY_CODE_FIELD}, {KEY_NAME_FIELD}) DO UPDATE SET {}",
        columns.join(", "),
        sets.join(", ")
    )
}

fn sink_upsert_sql(mapping: &FieldMapping) -> String {
    let mut columns: Vec<&str> = mapping.field_names().collect();
    let mut updates: Vec<&str> = mapping
        .field_names()
        .filter(|name| !FieldMapping::is_key_field(name))
        .collect();
    columns.extend(BOOKKEEPING_COLUMNS);
    updates.extend(BOOKKEEPING_COLUMNS);
    upsert_statement(mapping.table_name, &columns, &updates)
}

fn enrichment_upsert_sql(succeeded: bool) -> String {
    let mut columns: Vec<&str> = ENRICHMENT_SOURCE.field_names().collect();
    if succeeded {
        let mut updates: Vec<&str> = ENRICHMENT_SOURCE
            .field_names()
            .filter(|name| !FieldMapping::is_key_field(name))
            .collect();
        columns.extend(DETAIL_COLUMNS);
        updates.extend(DETAIL_COLUMNS);
        columns.extend(BOOKKEEPING_COLUMNS);
        updates.extend(BOOKKEEPING_COLUMNS);
        upsert_statement(ENRICHMENT_TABLE, &columns, &updates)
    } else {
        columns.push("extraction_succeeded");
        columns.extend(BOOKKEEPING_COLUMNS);
        upsert_statement(ENRICHMENT_TABLE, &columns, BOOKKEEPING_COLUMNS)
    }
}

fn retire_sql(mapping: &FieldMapping) -> String {
    format!(
        r#"
        UPDATE {table}
           SET deleted_at = NOW()
         WHERE deleted_at IS NULL
           AND ({KEY_CODE_FIELD}, {KEY_NAME_FIELD}) IN (
               SELECT * FROM UNNEST($1::text[], $2::text[])
           )
        "#,
        table = mapping.table_name
    )
}

/// Idempotent DDL for every table the engine writes.
pub fn schema_statements() -> Vec<String> {
    let mut statements = Vec::new();
    for mapping in MAPPINGS {
        statements.push(create_table_sql(mapping.table_name, mapping, &[]));
        statements.push(natural_key_index_sql(mapping.table_name));
    }

    let detail_columns = [
        "nama_klpd TEXT",
        "tahun_anggaran TEXT",
        "total_pagu DOUBLE PRECISION",
        "sumber_dana_list JSONB NOT NULL DEFAULT '[]'::jsonb",
        "lokasi_pekerjaan JSONB NOT NULL DEFAULT '[]'::jsonb",
        "pemanfaatan_mulai DATE",
        "pemanfaatan_akhir DATE",
        "jadwal_kontrak_mulai DATE",
        "jadwal_kontrak_akhir DATE",
        "jadwal_pemilihan_mulai DATE",
        "jadwal_pemilihan_akhir DATE",
        "tanggal_umumkan_paket DATE",
        "tanggal_lain JSONB NOT NULL DEFAULT '[]'::jsonb",
        "extraction_succeeded BOOLEAN NOT NULL DEFAULT FALSE",
    ];
    statements.push(create_table_sql(
        ENRICHMENT_TABLE,
        ENRICHMENT_SOURCE,
        &detail_columns,
    ));
    statements.push(natural_key_index_sql(ENRICHMENT_TABLE));

    statements.push(
        r#"
        CREATE TABLE IF NOT EXISTS sync_runs (
            run_id UUID PRIMARY KEY,
            table_id TEXT NOT NULL,
            status TEXT NOT NULL,
            stage TEXT,
            fetched BIGINT NOT NULL DEFAULT 0,
            stored BIGINT NOT NULL DEFAULT 0,
            failed BIGINT NOT NULL DEFAULT 0,
            retired BIGINT NOT NULL DEFAULT 0,
            poor_mappings BIGINT NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT '',
            started_at TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ NOT NULL
        )
        "#
        .to_string(),
    );
    statements
}

fn create_table_sql(table: &str, mapping: &FieldMapping, extra: &[&str]) -> String {
    let mut columns = vec!["id BIGSERIAL PRIMARY KEY".to_string()];
    columns.extend(mapping.fields.iter().map(|field| {
        let default = field.default.replace('\'', "''");
        format!("{} TEXT NOT NULL DEFAULT '{default}'", field.name)
    }));
    columns.extend(extra.iter().map(|c| c.to_string()));
    columns.push("active_year TEXT NOT NULL DEFAULT ''".to_string());
    columns.push("created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()".to_string());
    columns.push("last_update BIGINT NOT NULL DEFAULT 0".to_string());
    columns.push("deleted_at TIMESTAMPTZ".to_string());
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n)",
        columns.join(",\n    ")
    )
}

fn natural_key_index_sql(table: &str) -> String {
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {table}_natural_key ON {table} ({KEY_CODE_FIELD}, {KEY_NAME_FIELD})"
    )
}

fn field_values(mapping: &FieldMapping, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
    mapping
        .fields
        .iter()
        .map(|field| lookup(field.name).unwrap_or_else(|| field.default.to_string()))
        .collect()
}

pub struct PgCycle {
    tx: Transaction<'static, Postgres>,
}

impl PgCycle {
    /// Runs one statement inside a savepoint so a failure leaves the outer
    /// transaction usable.
    async fn in_savepoint(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<u64, StoreError> {
        let mut savepoint = Acquire::begin(&mut self.tx).await?;
        match query.execute(&mut *savepoint).await {
            Ok(done) => {
                savepoint.commit().await?;
                Ok(done.rows_affected())
            }
            Err(err) => {
                if let Err(rollback) = savepoint.rollback().await {
                    warn!(error = %rollback, "rolling back savepoint failed");
                }
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl CycleTransaction for PgCycle {
    async fn upsert(
        &mut self,
        mapping: &FieldMapping,
        dataset: &OrderedDataset,
        stamp: &UpsertStamp,
    ) -> Result<(), StoreError> {
        let sql = sink_upsert_sql(mapping);
        let values = field_values(mapping, |name| dataset.get(name).map(str::to_string));
        let mut query = sqlx::query(&sql);
        for value in values {
            query = query.bind(value);
        }
        let query = query
            .bind(stamp.active_year.clone())
            .bind(stamp.last_update);
        self.in_savepoint(query).await.map(|_| ())
    }

    async fn retire(
        &mut self,
        mapping: &FieldMapping,
        keys: &[NaturalKey],
    ) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let sql = retire_sql(mapping);
        let codes: Vec<String> = keys.iter().map(|k| k.kode_rup.clone()).collect();
        let names: Vec<String> = keys.iter().map(|k| k.nama_paket.clone()).collect();
        let query = sqlx::query(&sql).bind(codes).bind(names);
        self.in_savepoint(query).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SinkStore for PgSinkStore {
    async fn live_keys(&self, mapping: &FieldMapping) -> Result<HashSet<NaturalKey>, StoreError> {
        let sql = format!(
            "SELECT {KEY_CODE_FIELD}, {KEY_NAME_FIELD} FROM {} WHERE deleted_at IS NULL",
            mapping.table_name
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut keys = HashSet::with_capacity(rows.len());
        for row in rows {
            keys.insert(NaturalKey::new(
                row.try_get::<String, _>(KEY_CODE_FIELD)?,
                row.try_get::<String, _>(KEY_NAME_FIELD)?,
            ));
        }
        debug!(table = mapping.table_name, live = keys.len(), "snapshot taken");
        Ok(keys)
    }

    async fn begin_cycle(&self) -> Result<Box<dyn CycleTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgCycle { tx }))
    }

    async fn count_live(&self, table_name: &str) -> Result<i64, StoreError> {
        let table = checked_table(table_name)?;
        let sql = format!("SELECT COUNT(*) AS live FROM {table} WHERE deleted_at IS NULL");
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("live")?)
    }

    async fn list_live(&self, table_name: &str, page: Page) -> Result<Vec<JsonValue>, StoreError> {
        let table = checked_table(table_name)?;
        let sql = format!(
            r#"
            SELECT to_jsonb(t) AS row
              FROM {table} t
             WHERE t.deleted_at IS NULL
             ORDER BY t.created_at DESC, t.id DESC
             LIMIT $1 OFFSET $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<JsonValue, _>("row").map_err(StoreError::from))
            .collect()
    }

    async fn primary_rows(
        &self,
        mapping: &FieldMapping,
        kode_rup: &str,
    ) -> Result<Vec<Vec<(String, String)>>, StoreError> {
        let columns: Vec<&str> = mapping.field_names().collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {KEY_CODE_FIELD} = $1 AND deleted_at IS NULL ORDER BY created_at, id",
            columns.join(", "),
            mapping.table_name
        );
        let rows = sqlx::query(&sql)
            .bind(kode_rup)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(columns.len());
            for column in &columns {
                values.push((column.to_string(), row.try_get::<String, _>(*column)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    async fn keys_lacking_enrichment(&self) -> Result<Vec<NaturalKey>, StoreError> {
        let sql = format!(
            r#"
            SELECT p.kode_rup, p.nama_paket
              FROM {primary} p
              LEFT JOIN {ENRICHMENT_TABLE} s
                ON s.kode_rup = p.kode_rup
               AND s.nama_paket = p.nama_paket
               AND s.deleted_at IS NULL
             WHERE p.deleted_at IS NULL
               AND (s.id IS NULL OR s.extraction_succeeded = FALSE)
             ORDER BY p.kode_rup, p.nama_paket
            "#,
            primary = ENRICHMENT_SOURCE.table_name
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                Ok(NaturalKey::new(
                    row.try_get::<String, _>("kode_rup")?,
                    row.try_get::<String, _>("nama_paket")?,
                ))
            })
            .collect()
    }

    async fn upsert_enrichment(
        &self,
        record: &EnrichmentRecord,
        stamp: &UpsertStamp,
    ) -> Result<(), StoreError> {
        let sql = enrichment_upsert_sql(record.extraction_succeeded);
        let values = field_values(ENRICHMENT_SOURCE, |name| match name {
            KEY_CODE_FIELD => Some(record.key.kode_rup.clone()),
            KEY_NAME_FIELD => Some(record.key.nama_paket.clone()),
            _ => record
                .primary
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, value)| value.clone()),
        });
        let mut query = sqlx::query(&sql);
        for value in values {
            query = query.bind(value);
        }

        let query = if record.extraction_succeeded {
            let detail = &record.detail;
            query
                .bind(detail.nama_klpd.clone())
                .bind(detail.tahun_anggaran.clone())
                .bind(detail.total_pagu)
                .bind(Json(detail.sumber_dana.clone()))
                .bind(Json(detail.lokasi_pekerjaan.clone()))
                .bind(detail.pemanfaatan.start)
                .bind(detail.pemanfaatan.end)
                .bind(detail.jadwal_kontrak.start)
                .bind(detail.jadwal_kontrak.end)
                .bind(detail.jadwal_pemilihan.start)
                .bind(detail.jadwal_pemilihan.end)
                .bind(detail.tanggal_umumkan)
                .bind(Json(detail.unlabeled_dates.clone()))
                .bind(true)
        } else {
            query.bind(false)
        };

        query
            .bind(stamp.active_year.clone())
            .bind(stamp.last_update)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retire_orphaned_enrichment(&self) -> Result<u64, StoreError> {
        let sql = format!(
            r#"
            UPDATE {ENRICHMENT_TABLE} s
               SET deleted_at = NOW()
             WHERE s.deleted_at IS NULL
               AND NOT EXISTS (
                   SELECT 1
                     FROM {primary} p
                    WHERE p.kode_rup = s.kode_rup
                      AND p.nama_paket = s.nama_paket
                      AND p.deleted_at IS NULL
               )
            "#,
            primary = ENRICHMENT_SOURCE.table_name
        );
        let done = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn enrichment_by_code(&self, kode_rup: &str) -> Result<Vec<JsonValue>, StoreError> {
        let sql = format!(
            r#"
            SELECT to_jsonb(s) AS row
              FROM {ENRICHMENT_TABLE} s
             WHERE s.kode_rup = $1
               AND s.deleted_at IS NULL
             ORDER BY s.nama_paket
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(kode_rup)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<JsonValue, _>("row").map_err(StoreError::from))
            .collect()
    }

    async fn record_run(&self, run: &SyncRunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (
                run_id, table_id, status, stage, fetched, stored, failed,
                retired, poor_mappings, message, started_at, finished_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.table_id)
        .bind(&run.status)
        .bind(&run.stage)
        .bind(run.fetched)
        .bind(run.stored)
        .bind(run.failed)
        .bind(run.retired)
        .bind(run.poor_mappings)
        .bind(&run.message)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

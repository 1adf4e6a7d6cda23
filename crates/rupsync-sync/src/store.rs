//! Persistence seam between the sync engine and the database.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rupsync_core::{EnrichmentRecord, FieldMapping, NaturalKey, OrderedDataset};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_PAGE_LIMIT: i64 = 100;
pub const MAX_PAGE_LIMIT: i64 = 1_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no sink table is known for {0}")]
    NoSchema(String),
}

/// Values written alongside every upsert of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertStamp {
    /// Unix epoch seconds.
    pub last_update: i64,
    pub active_year: String,
}

impl UpsertStamp {
    pub fn now(active_year: impl Into<String>) -> Self {
        Self {
            last_update: Utc::now().timestamp(),
            active_year: active_year.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Page {
    pub fn new(offset: Option<i64>, limit: Option<i64>) -> Self {
        Self {
            offset: offset.unwrap_or(0).max(0),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One row of `sync_runs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRunRecord {
    pub run_id: Uuid,
    pub table_id: String,
    pub status: String,
    pub stage: Option<String>,
    pub fetched: i64,
    pub stored: i64,
    pub failed: i64,
    pub retired: i64,
    pub poor_mappings: i64,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Writes of one sync cycle. Nothing is visible to readers before `commit`.
///
/// A failing `upsert` or `retire` leaves the transaction usable for the
/// statements that follow it.
#[async_trait]
pub trait CycleTransaction: Send {
    async fn upsert(
        &mut self,
        mapping: &FieldMapping,
        dataset: &OrderedDataset,
        stamp: &UpsertStamp,
    ) -> Result<(), StoreError>;

    /// Soft-deletes the live rows among `keys`, returning how many changed.
    async fn retire(
        &mut self,
        mapping: &FieldMapping,
        keys: &[NaturalKey],
    ) -> Result<u64, StoreError>;

    /// A failed commit leaves nothing staged; dropping an uncommitted cycle rolls it back.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SinkStore: Send + Sync {
    /// Natural keys of every row with no retirement marker.
    async fn live_keys(&self, mapping: &FieldMapping) -> Result<HashSet<NaturalKey>, StoreError>;

    async fn begin_cycle(&self) -> Result<Box<dyn CycleTransaction>, StoreError>;

    async fn count_live(&self, table_name: &str) -> Result<i64, StoreError>;

    /// Live rows as JSON objects, newest first.
    async fn list_live(&self, table_name: &str, page: Page) -> Result<Vec<JsonValue>, StoreError>;

    /// Field values of every live row carrying `kode_rup`, in mapping order.
    async fn primary_rows(
        &self,
        mapping: &FieldMapping,
        kode_rup: &str,
    ) -> Result<Vec<Vec<(String, String)>>, StoreError>;

    /// Live primary keys with no live enrichment row or only a failed one.
    async fn keys_lacking_enrichment(&self) -> Result<Vec<NaturalKey>, StoreError>;

    /// Failed records never overwrite the detail columns of an existing row.
    async fn upsert_enrichment(
        &self,
        record: &EnrichmentRecord,
        stamp: &UpsertStamp,
    ) -> Result<(), StoreError>;

    /// Retires enrichment rows whose key is no longer live in the primary table.
    async fn retire_orphaned_enrichment(&self) -> Result<u64, StoreError>;

    async fn enrichment_by_code(&self, kode_rup: &str) -> Result<Vec<JsonValue>, StoreError>;

    async fn record_run(&self, run: &SyncRunRecord) -> Result<(), StoreError>;
}

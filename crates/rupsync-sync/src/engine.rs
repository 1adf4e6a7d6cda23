//! Reconciliation sync cycle: fetch one endpoint, upsert what came back and
//! retire what disappeared, all in one transaction.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rupsync_adapters::{normalize, PortalContext, PortalSource, SourceError};
use rupsync_core::{field_mapping, NaturalKey, ENRICHMENT_TABLE, MAPPINGS};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EndpointRegistry;
use crate::store::{Page, SinkStore, StoreError, SyncRunRecord, UpsertStamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    TokenAcquired,
    ItemsFetched,
    Normalizing,
    Upserting,
    Reconciling,
    Committed,
    RolledBack,
}

/// Where a cycle stopped when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    Lookup,
    Snapshot,
    Token,
    Fetch,
    Begin,
    Commit,
}

impl CycleStage {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStage::Lookup => "lookup",
            CycleStage::Snapshot => "snapshot",
            CycleStage::Token => "token",
            CycleStage::Fetch => "fetch",
            CycleStage::Begin => "begin",
            CycleStage::Commit => "commit",
        }
    }
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("no endpoint is configured for table {0}")]
    UnknownTable(String),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A fatal cycle outcome. Nothing the cycle wrote is visible.
#[derive(Debug, Error)]
#[error("sync of {table} failed during {stage}: {error}")]
pub struct CycleFailure {
    pub run_id: Uuid,
    pub table: String,
    pub stage: CycleStage,
    #[source]
    pub error: CycleError,
}

impl CycleFailure {
    /// The failure came from the portal rather than from storage.
    pub fn is_upstream(&self) -> bool {
        matches!(self.error, CycleError::Source(_))
    }

    pub fn is_unknown_table(&self) -> bool {
        matches!(self.error, CycleError::UnknownTable(_))
    }

    pub fn summary(&self) -> FailureSummary {
        FailureSummary {
            run_id: self.run_id,
            table: self.table.clone(),
            stage: self.stage,
            error: self.error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub run_id: Uuid,
    pub table: String,
    pub stage: CycleStage,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub table: String,
    pub state: CycleState,
    pub fetched: usize,
    pub stored: usize,
    pub failed: usize,
    pub retired: usize,
    pub poor_mappings: usize,
    /// Retirement was attempted and failed; stale rows stay live until the next cycle.
    pub retire_failed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub message: String,
}

impl CycleReport {
    fn new(run_id: Uuid, table: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            table: table.to_string(),
            state: CycleState::Idle,
            fetched: 0,
            stored: 0,
            failed: 0,
            retired: 0,
            poor_mappings: 0,
            retire_failed: false,
            started_at,
            finished_at: started_at,
            message: String::new(),
        }
    }

    fn transition(&mut self, state: CycleState) {
        if self.state != state {
            debug!(from = ?self.state, state = ?state, "cycle state");
            self.state = state;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TableOutcome {
    Completed(CycleReport),
    Failed(FailureSummary),
}

#[derive(Debug, Clone, Serialize)]
pub struct AllCyclesReport {
    pub tables_succeeded: usize,
    pub tables_total: usize,
    pub stored: usize,
    pub failed: usize,
    pub retired: usize,
    pub results: Vec<TableOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableCount {
    pub table: String,
    pub table_name: String,
    pub live: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Counts {
    pub tables: Vec<TableCount>,
    pub enrichment: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub offset: i64,
    pub limit: i64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub data: Vec<JsonValue>,
    pub pagination: Pagination,
}

impl Listing {
    fn new(data: Vec<JsonValue>, page: Page) -> Self {
        let count = data.len();
        Self {
            data,
            pagination: Pagination {
                offset: page.offset,
                limit: page.limit,
                count,
            },
        }
    }
}

pub struct SyncEngine {
    pub(crate) source: Arc<dyn PortalSource>,
    pub(crate) store: Arc<dyn SinkStore>,
    endpoints: EndpointRegistry,
    pub(crate) context: PortalContext,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn PortalSource>,
        store: Arc<dyn SinkStore>,
        endpoints: EndpointRegistry,
        context: PortalContext,
    ) -> Self {
        Self {
            source,
            store,
            endpoints,
            context,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn context(&self) -> &PortalContext {
        &self.context
    }

    /// Serializes work on one table. Callers queue rather than fail.
    pub(crate) async fn lock_table(&self, table: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(table.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Runs one reconciliation cycle for `table_id`.
    pub async fn run_cycle(&self, table_id: &str) -> Result<CycleReport, CycleFailure> {
        let run_id = Uuid::new_v4();
        let _guard = self.lock_table(table_id).await;
        let started_at = Utc::now();
        let outcome = self
            .cycle(run_id, table_id, started_at)
            .instrument(info_span!("sync_cycle", %run_id, table = table_id))
            .await;
        self.record(table_id, run_id, started_at, &outcome).await;
        outcome
    }

    async fn cycle(
        &self,
        run_id: Uuid,
        table_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<CycleReport, CycleFailure> {
        let fail = |stage: CycleStage, error: CycleError| {
            warn!(stage = %stage, error = %error, "sync cycle failed");
            CycleFailure {
                run_id,
                table: table_id.to_string(),
                stage,
                error,
            }
        };

        let endpoint = self.endpoints.get(table_id).ok_or_else(|| {
            fail(
                CycleStage::Lookup,
                CycleError::UnknownTable(table_id.to_string()),
            )
        })?;
        let mapping = field_mapping(table_id);
        let mut report = CycleReport::new(run_id, table_id, started_at);

        let pre_cycle: HashSet<NaturalKey> = match mapping {
            Some(mapping) => self
                .store
                .live_keys(mapping)
                .await
                .map_err(|err| fail(CycleStage::Snapshot, err.into()))?,
            None => HashSet::new(),
        };

        let token = self
            .source
            .acquire_token()
            .await
            .map_err(|err| fail(CycleStage::Token, err.into()))?;
        report.transition(CycleState::TokenAcquired);

        let items = self
            .source
            .fetch_endpoint(endpoint, &token, &self.context)
            .await
            .map_err(|err| fail(CycleStage::Fetch, err.into()))?;
        report.fetched = items.len();
        report.transition(CycleState::ItemsFetched);
        info!(fetched = items.len(), live_before = pre_cycle.len(), "items fetched");

        let mut tx = self
            .store
            .begin_cycle()
            .await
            .map_err(|err| fail(CycleStage::Begin, err.into()))?;
        let stamp = UpsertStamp::now(self.context.active_year.clone());
        let mut seen: HashSet<NaturalKey> = HashSet::with_capacity(items.len());

        report.transition(CycleState::Normalizing);
        for (index, item) in items.iter().enumerate() {
            let dataset = match normalize(table_id, item) {
                Ok(dataset) => dataset,
                Err(err) => {
                    report.failed += 1;
                    warn!(index, shape = item.shape(), error = %err, "item skipped");
                    continue;
                }
            };
            if dataset.status.is_poor() {
                report.poor_mappings += 1;
            }
            let Some(key) = dataset.natural_key() else {
                report.failed += 1;
                warn!(index, "item has no kode_rup; skipped");
                continue;
            };
            seen.insert(key.clone());

            report.transition(CycleState::Upserting);
            let written = match mapping {
                Some(mapping) => tx.upsert(mapping, &dataset, &stamp).await,
                None => Err(StoreError::NoSchema(table_id.to_string())),
            };
            match written {
                Ok(()) => report.stored += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(index, kode_rup = %key.kode_rup, error = %err, "upsert failed");
                }
            }
        }

        report.transition(CycleState::Reconciling);
        if let Some(mapping) = mapping {
            let mut stale: Vec<NaturalKey> = pre_cycle.difference(&seen).cloned().collect();
            stale.sort();
            if !stale.is_empty() {
                match tx.retire(mapping, &stale).await {
                    Ok(retired) => report.retired = retired as usize,
                    Err(err) => {
                        report.retire_failed = true;
                        warn!(stale = stale.len(), error = %err, "retirement failed; rows stay live");
                    }
                }
            }
        }

        if let Err(err) = tx.commit().await {
            report.transition(CycleState::RolledBack);
            return Err(fail(CycleStage::Commit, err.into()));
        }
        report.transition(CycleState::Committed);
        report.finished_at = Utc::now();
        report.message = format!(
            "{} fetched, {} stored, {} failed, {} retired",
            report.fetched, report.stored, report.failed, report.retired
        );
        info!(
            fetched = report.fetched,
            stored = report.stored,
            failed = report.failed,
            retired = report.retired,
            poor_mappings = report.poor_mappings,
            "sync cycle committed"
        );
        Ok(report)
    }

    async fn record(
        &self,
        table_id: &str,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        outcome: &Result<CycleReport, CycleFailure>,
    ) {
        let run = match outcome {
            Ok(report) => SyncRunRecord {
                run_id,
                table_id: table_id.to_string(),
                status: "committed".to_string(),
                stage: None,
                fetched: report.fetched as i64,
                stored: report.stored as i64,
                failed: report.failed as i64,
                retired: report.retired as i64,
                poor_mappings: report.poor_mappings as i64,
                message: report.message.clone(),
                started_at,
                finished_at: report.finished_at,
            },
            Err(failure) => SyncRunRecord {
                run_id,
                table_id: table_id.to_string(),
                status: "failed".to_string(),
                stage: Some(failure.stage.as_str().to_string()),
                fetched: 0,
                stored: 0,
                failed: 0,
                retired: 0,
                poor_mappings: 0,
                message: failure.error.to_string(),
                started_at,
                finished_at: Utc::now(),
            },
        };
        if let Err(err) = self.store.record_run(&run).await {
            warn!(%run_id, table = table_id, error = %err, "could not record sync run");
        }
    }

    /// Runs every enabled endpoint in turn. One table failing does not stop the rest.
    pub async fn run_all(&self) -> AllCyclesReport {
        let tables: Vec<String> = self.endpoints.enabled().map(|e| e.table.clone()).collect();
        let mut report = AllCyclesReport {
            tables_succeeded: 0,
            tables_total: tables.len(),
            stored: 0,
            failed: 0,
            retired: 0,
            results: Vec::with_capacity(tables.len()),
        };
        for table in tables {
            match self.run_cycle(&table).await {
                Ok(cycle) => {
                    report.tables_succeeded += 1;
                    report.stored += cycle.stored;
                    report.failed += cycle.failed;
                    report.retired += cycle.retired;
                    report.results.push(TableOutcome::Completed(cycle));
                }
                Err(failure) => report.results.push(TableOutcome::Failed(failure.summary())),
            }
        }
        info!(
            succeeded = report.tables_succeeded,
            total = report.tables_total,
            "all sync cycles finished"
        );
        report
    }

    pub async fn counts(&self) -> Result<Counts, StoreError> {
        let mut tables = Vec::with_capacity(MAPPINGS.len());
        for mapping in MAPPINGS {
            tables.push(TableCount {
                table: mapping.table_id.to_string(),
                table_name: mapping.table_name.to_string(),
                live: self.store.count_live(mapping.table_name).await?,
            });
        }
        let enrichment = self.store.count_live(ENRICHMENT_TABLE).await?;
        let total = tables.iter().map(|t| t.live).sum::<i64>() + enrichment;
        Ok(Counts {
            tables,
            enrichment,
            total,
        })
    }

    pub async fn list_records(&self, table_id: &str, page: Page) -> Result<Listing, StoreError> {
        let mapping =
            field_mapping(table_id).ok_or_else(|| StoreError::NoSchema(table_id.to_string()))?;
        let data = self.store.list_live(mapping.table_name, page).await?;
        Ok(Listing::new(data, page))
    }

    pub async fn list_enrichment(&self, page: Page) -> Result<Listing, StoreError> {
        let data = self.store.list_live(ENRICHMENT_TABLE, page).await?;
        Ok(Listing::new(data, page))
    }

    pub async fn enrichment_for(&self, kode_rup: &str) -> Result<Vec<JsonValue>, StoreError> {
        self.store.enrichment_by_code(kode_rup).await
    }
}

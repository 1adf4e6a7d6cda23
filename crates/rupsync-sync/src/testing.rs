//! In-memory store and scripted portal used by the engine tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rupsync_adapters::{Endpoint, PortalContext, PortalSource, SourceError};
use rupsync_core::{
    EnrichmentRecord, FieldMapping, NaturalKey, OrderedDataset, RawItem, ENRICHMENT_SOURCE,
    ENRICHMENT_TABLE,
};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::config::EndpointRegistry;
use crate::engine::SyncEngine;
use crate::store::{CycleTransaction, Page, SinkStore, StoreError, SyncRunRecord, UpsertStamp};

fn refused(what: &str) -> StoreError {
    StoreError::Database(sqlx::Error::Protocol(format!("{what} refused")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemRow {
    pub values: Vec<(String, String)>,
    pub created_seq: u64,
    pub last_update: i64,
    pub deleted_at: Option<u64>,
}

impl MemRow {
    pub fn value(&self, field: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct MemEnrichment {
    pub record: EnrichmentRecord,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: BTreeMap<String, BTreeMap<NaturalKey, MemRow>>,
    seq: u64,
}

impl Tables {
    fn tick(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn live<'a>(&'a self, table: &str) -> impl Iterator<Item = (&'a NaturalKey, &'a MemRow)> {
        self.rows
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.iter())
            .filter(|(_, row)| row.deleted_at.is_none())
    }
}

#[derive(Debug, Clone, Default)]
struct Faults {
    upsert_codes: HashSet<String>,
    retire: bool,
    commit: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    enrichment: Mutex<BTreeMap<NaturalKey, MemEnrichment>>,
    runs: Mutex<Vec<SyncRunRecord>>,
    faults: Mutex<Faults>,
    begun: AtomicUsize,
}

impl MemoryStore {
    pub fn fail_upserts_for(&self, kode_rup: &str) {
        self.faults
            .lock()
            .expect("faults")
            .upsert_codes
            .insert(kode_rup.to_string());
    }

    pub fn fail_retire(&self, fail: bool) {
        self.faults.lock().expect("faults").retire = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        self.faults.lock().expect("faults").commit = fail;
    }

    pub fn cycles_begun(&self) -> usize {
        self.begun.load(Ordering::SeqCst)
    }

    pub fn rows(&self, table: &str) -> Vec<MemRow> {
        let tables = self.tables.lock().expect("tables");
        tables
            .rows
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, key: &NaturalKey) -> Option<MemRow> {
        let tables = self.tables.lock().expect("tables");
        tables.rows.get(table)?.get(key).cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    pub fn live_count(&self, table: &str) -> usize {
        self.tables.lock().expect("tables").live(table).count()
    }

    pub fn runs(&self) -> Vec<SyncRunRecord> {
        self.runs.lock().expect("runs").clone()
    }

    pub fn enrichment(&self, key: &NaturalKey) -> Option<MemEnrichment> {
        self.enrichment.lock().expect("enrichment").get(key).cloned()
    }
}

struct MemoryCycle {
    staged: Tables,
    shared: Arc<Mutex<Tables>>,
    faults: Faults,
}

#[async_trait]
impl CycleTransaction for MemoryCycle {
    async fn upsert(
        &mut self,
        mapping: &FieldMapping,
        dataset: &OrderedDataset,
        stamp: &UpsertStamp,
    ) -> Result<(), StoreError> {
        let key = dataset
            .natural_key()
            .ok_or_else(|| refused("keyless upsert"))?;
        if self.faults.upsert_codes.contains(&key.kode_rup) {
            return Err(refused("upsert"));
        }
        let seq = self.staged.tick();
        let values: Vec<(String, String)> = mapping
            .fields
            .iter()
            .map(|f| {
                let value = dataset.get(f.name).unwrap_or(f.default);
                (f.name.to_string(), value.to_string())
            })
            .collect();
        let table = self
            .staged
            .rows
            .entry(mapping.table_name.to_string())
            .or_default();
        match table.get_mut(&key) {
            Some(row) => {
                row.values = values;
                row.last_update = stamp.last_update;
                row.deleted_at = None;
            }
            None => {
                table.insert(
                    key,
                    MemRow {
                        values,
                        created_seq: seq,
                        last_update: stamp.last_update,
                        deleted_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn retire(
        &mut self,
        mapping: &FieldMapping,
        keys: &[NaturalKey],
    ) -> Result<u64, StoreError> {
        if self.faults.retire {
            return Err(refused("retire"));
        }
        let seq = self.staged.tick();
        let mut retired = 0;
        if let Some(table) = self.staged.rows.get_mut(mapping.table_name) {
            for key in keys {
                if let Some(row) = table.get_mut(key).filter(|r| r.deleted_at.is_none()) {
                    row.deleted_at = Some(seq);
                    retired += 1;
                }
            }
        }
        Ok(retired)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.faults.commit {
            return Err(refused("commit"));
        }
        *self.shared.lock().expect("tables") = self.staged;
        Ok(())
    }
}

fn row_json(row: &MemRow) -> JsonValue {
    let mut map = JsonMap::new();
    for (name, value) in &row.values {
        map.insert(name.clone(), JsonValue::String(value.clone()));
    }
    map.insert("last_update".into(), row.last_update.into());
    map.insert("deleted_at".into(), JsonValue::Null);
    JsonValue::Object(map)
}

#[async_trait]
impl SinkStore for MemoryStore {
    async fn live_keys(&self, mapping: &FieldMapping) -> Result<HashSet<NaturalKey>, StoreError> {
        let tables = self.tables.lock().expect("tables");
        Ok(tables
            .live(mapping.table_name)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn begin_cycle(&self) -> Result<Box<dyn CycleTransaction>, StoreError> {
        self.begun.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryCycle {
            staged: self.tables.lock().expect("tables").clone(),
            shared: self.tables.clone(),
            faults: self.faults.lock().expect("faults").clone(),
        }))
    }

    async fn count_live(&self, table_name: &str) -> Result<i64, StoreError> {
        if table_name == ENRICHMENT_TABLE {
            let rows = self.enrichment.lock().expect("enrichment");
            return Ok(rows.values().filter(|e| !e.deleted).count() as i64);
        }
        Ok(self.live_count(table_name) as i64)
    }

    async fn list_live(&self, table_name: &str, page: Page) -> Result<Vec<JsonValue>, StoreError> {
        let tables = self.tables.lock().expect("tables");
        let mut rows: Vec<&MemRow> = tables.live(table_name).map(|(_, row)| row).collect();
        rows.sort_by(|a, b| b.created_seq.cmp(&a.created_seq));
        Ok(rows
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .map(row_json)
            .collect())
    }

    async fn primary_rows(
        &self,
        mapping: &FieldMapping,
        kode_rup: &str,
    ) -> Result<Vec<Vec<(String, String)>>, StoreError> {
        let tables = self.tables.lock().expect("tables");
        let mut rows: Vec<&MemRow> = tables
            .live(mapping.table_name)
            .filter(|(key, _)| key.kode_rup == kode_rup)
            .map(|(_, row)| row)
            .collect();
        rows.sort_by_key(|row| row.created_seq);
        Ok(rows.into_iter().map(|row| row.values.clone()).collect())
    }

    async fn keys_lacking_enrichment(&self) -> Result<Vec<NaturalKey>, StoreError> {
        let tables = self.tables.lock().expect("tables");
        let enrichment = self.enrichment.lock().expect("enrichment");
        Ok(tables
            .live(ENRICHMENT_SOURCE.table_name)
            .map(|(key, _)| key)
            .filter(|key| match enrichment.get(*key) {
                Some(row) => row.deleted || !row.record.extraction_succeeded,
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn upsert_enrichment(
        &self,
        record: &EnrichmentRecord,
        _stamp: &UpsertStamp,
    ) -> Result<(), StoreError> {
        let mut rows = self.enrichment.lock().expect("enrichment");
        match rows.get_mut(&record.key) {
            Some(existing) if !record.extraction_succeeded => existing.deleted = false,
            _ => {
                rows.insert(
                    record.key.clone(),
                    MemEnrichment {
                        record: record.clone(),
                        deleted: false,
                    },
                );
            }
        }
        Ok(())
    }

    async fn retire_orphaned_enrichment(&self) -> Result<u64, StoreError> {
        let tables = self.tables.lock().expect("tables");
        let live: HashSet<&NaturalKey> = tables
            .live(ENRICHMENT_SOURCE.table_name)
            .map(|(key, _)| key)
            .collect();
        let mut rows = self.enrichment.lock().expect("enrichment");
        let mut retired = 0;
        for (key, row) in rows.iter_mut() {
            if !row.deleted && !live.contains(key) {
                row.deleted = true;
                retired += 1;
            }
        }
        Ok(retired)
    }

    async fn enrichment_by_code(&self, kode_rup: &str) -> Result<Vec<JsonValue>, StoreError> {
        let rows = self.enrichment.lock().expect("enrichment");
        Ok(rows
            .iter()
            .filter(|(key, row)| key.kode_rup == kode_rup && !row.deleted)
            .map(|(_, row)| serde_json::to_value(&row.record).unwrap_or(JsonValue::Null))
            .collect())
    }

    async fn record_run(&self, run: &SyncRunRecord) -> Result<(), StoreError> {
        self.runs.lock().expect("runs").push(run.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedSource {
    token: Mutex<Option<String>>,
    responses: Mutex<VecDeque<Result<Vec<JsonValue>, String>>>,
    details: Mutex<HashMap<String, String>>,
    token_requests: AtomicUsize,
    detail_requests: AtomicUsize,
}

impl ScriptedSource {
    pub fn with_token(token: &str) -> Self {
        let source = Self::default();
        source.set_token(Some(token));
        source
    }

    pub fn set_token(&self, token: Option<&str>) {
        *self.token.lock().expect("token") = token.map(str::to_string);
    }

    pub fn push_items(&self, items: Vec<JsonValue>) {
        self.responses.lock().expect("responses").push_back(Ok(items));
    }

    pub fn push_malformed(&self, reason: &str) {
        self.responses
            .lock()
            .expect("responses")
            .push_back(Err(reason.to_string()));
    }

    pub fn set_detail(&self, kode_rup: &str, html: &str) {
        self.details
            .lock()
            .expect("details")
            .insert(kode_rup.to_string(), html.to_string());
    }

    pub fn token_requests(&self) -> usize {
        self.token_requests.load(Ordering::SeqCst)
    }

    pub fn detail_requests(&self) -> usize {
        self.detail_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortalSource for ScriptedSource {
    async fn acquire_token(&self) -> Result<String, SourceError> {
        self.token_requests.fetch_add(1, Ordering::SeqCst);
        self.token
            .lock()
            .expect("token")
            .clone()
            .ok_or_else(|| SourceError::TokenNotFound {
                url: "http://portal.test/token".into(),
            })
    }

    async fn fetch_endpoint(
        &self,
        _endpoint: &Endpoint,
        _token: &str,
        _context: &PortalContext,
    ) -> Result<Vec<RawItem>, SourceError> {
        let next = self.responses.lock().expect("responses").pop_front();
        match next {
            Some(Ok(items)) => Ok(items.into_iter().map(RawItem::from_json).collect()),
            Some(Err(reason)) => Err(SourceError::MalformedEnvelope(reason)),
            None => Err(SourceError::MalformedEnvelope("no scripted response".into())),
        }
    }

    async fn fetch_detail_page(&self, kode_rup: &str) -> Result<String, SourceError> {
        self.detail_requests.fetch_add(1, Ordering::SeqCst);
        self.details
            .lock()
            .expect("details")
            .get(kode_rup)
            .cloned()
            .ok_or_else(|| SourceError::MalformedEnvelope(format!("no detail page for {kode_rup}")))
    }
}

pub fn engine_with(
    source: Arc<ScriptedSource>,
    store: Arc<MemoryStore>,
    tables: &[&str],
) -> SyncEngine {
    let endpoints = tables
        .iter()
        .map(|table| Endpoint {
            table: table.to_string(),
            path: format!("/dt/{table}"),
            enabled: true,
            display_name: None,
        })
        .collect();
    SyncEngine::new(
        source,
        store,
        EndpointRegistry::new(endpoints).expect("registry"),
        PortalContext {
            org_code: "D118".into(),
            active_year: "2025".into(),
        },
    )
}

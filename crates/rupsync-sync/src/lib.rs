//! Reconciliation sync engine, enrichment pass and their Postgres sink.

use std::sync::Arc;

use anyhow::Context;
use rupsync_adapters::PortalClient;

pub mod config;
pub mod engine;
pub mod enrich;
pub mod postgres;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, EndpointRegistry, SyncConfig};
pub use engine::{
    AllCyclesReport, CycleError, CycleFailure, CycleReport, CycleStage, CycleState, Counts,
    FailureSummary, Listing, Pagination, SyncEngine, TableCount, TableOutcome,
};
pub use enrich::{CodeEnrichment, EnrichAllReport, EnrichError};
pub use postgres::{schema_statements, PgSinkStore};
pub use store::{
    CycleTransaction, Page, SinkStore, StoreError, SyncRunRecord, UpsertStamp,
    DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT,
};

pub const CRATE_NAME: &str = "rupsync-sync";

/// Wires the portal client, the Postgres sink and the endpoint registry.
pub async fn build_engine(config: &SyncConfig) -> anyhow::Result<SyncEngine> {
    let endpoints = EndpointRegistry::load(&config.endpoints_file)
        .await
        .context("loading endpoint registry")?;
    let store = PgSinkStore::connect(&config.database_url)
        .await
        .context("connecting to the database")?;
    let client = PortalClient::new(config.portal_client_config())?;
    Ok(SyncEngine::new(
        Arc::new(client),
        Arc::new(store),
        endpoints,
        config.portal_context(),
    ))
}

pub async fn engine_from_env() -> anyhow::Result<SyncEngine> {
    build_engine(&SyncConfig::from_env()).await
}

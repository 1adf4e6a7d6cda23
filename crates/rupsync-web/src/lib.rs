//! JSON API over the sync engine: triggers and read accessors.

use std::fmt::Display;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rupsync_sync::{build_engine, EnrichError, Page, StoreError, SyncConfig, SyncEngine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "rupsync-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    offset: Option<i64>,
    limit: Option<i64>,
}

impl From<PageQuery> for Page {
    fn from(query: PageQuery) -> Self {
        Page::new(query.offset, query.limit)
    }
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

fn ok<T: Serialize>(success: bool, body: T) -> Response {
    Json(Envelope { success, body }).into_response()
}

fn failure(status: StatusCode, stage: &str, err: impl Display) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "stage": stage,
            "error": err.to_string(),
        })),
    )
        .into_response()
}

fn store_failure(err: StoreError) -> Response {
    match err {
        StoreError::NoSchema(_) => failure(StatusCode::NOT_FOUND, "lookup", err),
        StoreError::Database(_) => {
            error!(error = %err, "read failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "read", err)
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sync", post(sync_all_handler))
        .route("/sync/{table}", post(sync_table_handler))
        .route("/enrich", post(enrich_all_handler))
        .route("/enrich/{kode_rup}", post(enrich_one_handler))
        .route("/stats", get(stats_handler))
        .route("/records/{table}", get(records_handler))
        .route("/enrichment", get(enrichment_list_handler))
        .route("/enrichment/{kode_rup}", get(enrichment_lookup_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig) -> anyhow::Result<()> {
    let engine = build_engine(config).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "listening");
    axum::serve(listener, app(AppState::new(Arc::new(engine)))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&SyncConfig::from_env()).await
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn sync_table_handler(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
) -> Response {
    match state.engine.run_cycle(&table).await {
        Ok(report) => ok(true, report),
        Err(err) => {
            let status = if err.is_unknown_table() {
                StatusCode::NOT_FOUND
            } else if err.is_upstream() {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (
                status,
                Json(json!({
                    "success": false,
                    "run_id": err.run_id,
                    "table": err.table,
                    "stage": err.stage,
                    "error": err.error.to_string(),
                })),
            )
                .into_response()
        }
    }
}

async fn sync_all_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.engine.run_all().await;
    ok(report.tables_succeeded == report.tables_total, report)
}

async fn enrich_one_handler(
    State(state): State<Arc<AppState>>,
    Path(kode_rup): Path<String>,
) -> Response {
    match state.engine.enrich_one(&kode_rup).await {
        Ok(result) => ok(result.extraction_succeeded, result),
        Err(err @ EnrichError::UnknownKey(_)) => failure(StatusCode::NOT_FOUND, "lookup", err),
        Err(err @ EnrichError::Store(_)) => {
            failure(StatusCode::INTERNAL_SERVER_ERROR, "enrich", err)
        }
    }
}

async fn enrich_all_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.enrich_all().await {
        Ok(report) => ok(true, report),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, "enrich", err),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.counts().await {
        Ok(counts) => ok(true, counts),
        Err(err) => store_failure(err),
    }
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(query): Query<PageQuery>,
) -> Response {
    match state.engine.list_records(&table, query.into()).await {
        Ok(listing) => ok(true, listing),
        Err(err) => store_failure(err),
    }
}

async fn enrichment_list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Response {
    match state.engine.list_enrichment(query.into()).await {
        Ok(listing) => ok(true, listing),
        Err(err) => store_failure(err),
    }
}

async fn enrichment_lookup_handler(
    State(state): State<Arc<AppState>>,
    Path(kode_rup): Path<String>,
) -> Response {
    match state.engine.enrichment_for(&kode_rup).await {
        Ok(rows) if rows.is_empty() => failure(
            StatusCode::NOT_FOUND,
            "lookup",
            format!("no enrichment rows for {kode_rup}"),
        ),
        Ok(rows) => ok(true, json!({ "data": rows })),
        Err(err) => store_failure(err),
    }
}

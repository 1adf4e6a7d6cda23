//! Portal client: session token, endpoint POSTs, envelope unwrapping and
//! detail page retrieval.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use rupsync_core::RawItem;
use rupsync_storage::{
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, PayloadArchive, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tried in order; the first capture wins.
static TOKEN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r#"name=["']authenticityToken["'][^>]*value=["']([^"']+)["']"#).unwrap(),
        Regex::new(r#"d\.authenticityToken\s*=\s*['"]([^'"]+)['"]"#).unwrap(),
        Regex::new(r#"<input[^>]*name=["']?authenticityToken["']?[^>]*value=["']?([^"'\s>]+)"#)
            .unwrap(),
        Regex::new(r#"<input[^>]*value=["']([^"']+)["'][^>]*name=["']authenticityToken["']"#)
            .unwrap(),
        Regex::new(r#"authenticityToken["']?\s*[:=]\s*["']([^"']+)["']"#).unwrap(),
        Regex::new(r#"(?i)csrf[_-]?token["']?\s*[:=]\s*["']([^"']+)["']"#).unwrap(),
    ]
});

const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "id-ID,id;q=0.9,en-US;q=0.8,en;q=0.7";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("authenticity token not found on {url}")]
    TokenNotFound { url: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("response body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("malformed response envelope: {0}")]
    MalformedEnvelope(String),
}

/// One configured portal endpoint feeding a sink table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub table: String,
    pub path: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Context form parameters sent with every endpoint POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalContext {
    pub org_code: String,
    pub active_year: String,
}

/// The network seam used by the sync engine and the enrichment pass.
#[async_trait]
pub trait PortalSource: Send + Sync {
    async fn acquire_token(&self) -> Result<String, SourceError>;

    async fn fetch_endpoint(
        &self,
        endpoint: &Endpoint,
        token: &str,
        context: &PortalContext,
    ) -> Result<Vec<RawItem>, SourceError>;

    /// Returns the HTML of the detail page for one procurement code.
    async fn fetch_detail_page(&self, kode_rup: &str) -> Result<String, SourceError>;
}

#[derive(Debug, Clone)]
pub struct PortalClientConfig {
    pub base_url: String,
    pub token_path: String,
    pub referer: String,
    pub detail_url_template: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub bulk_retry_base: Duration,
    pub detail_retry_base: Duration,
    pub detail_interval: Duration,
    pub archive_dir: Option<PathBuf>,
}

pub struct PortalClient {
    config: PortalClientConfig,
    portal: HttpFetcher,
    detail: HttpFetcher,
    archive: Option<PayloadArchive>,
}

impl PortalClient {
    pub fn new(config: PortalClientConfig) -> anyhow::Result<Self> {
        let portal = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(config.user_agent.clone()),
            retry: RetryPolicy::with_base_delay(config.bulk_retry_base),
            cookie_store: true,
            ..Default::default()
        })?;
        let detail = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(config.user_agent.clone()),
            max_in_flight: 1,
            retry: RetryPolicy::with_base_delay(config.detail_retry_base),
            min_interval: Some(config.detail_interval),
            cookie_store: false,
        })?;
        let archive = config.archive_dir.clone().map(PayloadArchive::new);
        Ok(Self {
            config,
            portal,
            detail,
            archive,
        })
    }

    pub fn token_url(&self) -> String {
        join_url(&self.config.base_url, &self.config.token_path)
    }

    pub fn endpoint_url(&self, endpoint: &Endpoint) -> String {
        join_url(&self.config.base_url, &endpoint.path)
    }

    pub fn detail_url(&self, kode_rup: &str) -> String {
        self.config.detail_url_template.replace("{kode_rup}", kode_rup)
    }

    async fn keep_copy(&self, channel: &str, extension: &str, resp: &FetchedResponse) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.archive(channel, Utc::now(), extension, &resp.body).await {
            Ok(stored) => debug!(
                channel,
                path = %stored.relative_path.display(),
                reused = stored.reused,
                "archived payload"
            ),
            Err(err) => warn!(channel, error = %err, "could not archive payload"),
        }
    }
}

#[async_trait]
impl PortalSource for PortalClient {
    async fn acquire_token(&self) -> Result<String, SourceError> {
        let url = self.token_url();
        let resp = self
            .portal
            .get(
                &url,
                &[
                    ("Accept", BROWSER_ACCEPT),
                    ("Accept-Language", ACCEPT_LANGUAGE),
                    ("Cache-Control", "no-cache"),
                    ("Upgrade-Insecure-Requests", "1"),
                ],
            )
            .await?;
        let page = resp.text();
        match extract_token(&page) {
            Some(token) => {
                debug!(token_len = token.len(), "authenticity token acquired");
                Ok(token)
            }
            None => Err(SourceError::TokenNotFound { url }),
        }
    }

    async fn fetch_endpoint(
        &self,
        endpoint: &Endpoint,
        token: &str,
        context: &PortalContext,
    ) -> Result<Vec<RawItem>, SourceError> {
        let url = self.endpoint_url(endpoint);
        let form = [
            ("authenticityToken", token),
            ("activeSatker", ""),
            ("activeInstansi", context.org_code.as_str()),
            ("activeYear", context.active_year.as_str()),
        ];
        let resp = self
            .portal
            .post_form(
                &url,
                &form,
                &[
                    ("X-Requested-With", "XMLHttpRequest"),
                    ("Accept", "application/json, text/javascript, */*; q=0.01"),
                    ("Accept-Language", ACCEPT_LANGUAGE),
                    ("Referer", self.config.referer.as_str()),
                ],
            )
            .await?;
        self.keep_copy(&endpoint.table, "json", &resp).await;

        let items = unwrap_envelope(&resp.body)?;
        info!(
            table = %endpoint.table,
            items = items.len(),
            attempts = resp.attempts,
            "endpoint fetched"
        );
        Ok(items)
    }

    async fn fetch_detail_page(&self, kode_rup: &str) -> Result<String, SourceError> {
        let url = self.detail_url(kode_rup);
        let resp = self
            .detail
            .get(
                &url,
                &[("Accept", BROWSER_ACCEPT), ("Accept-Language", ACCEPT_LANGUAGE)],
            )
            .await?;
        self.keep_copy("detail", "html", &resp).await;
        Ok(resp.text())
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Searches a page for the embedded session token.
pub fn extract_token(page: &str) -> Option<String> {
    TOKEN_PATTERNS.iter().find_map(|re| {
        re.captures(page)
            .map(|caps| caps[1].trim().to_string())
            .filter(|token| !token.is_empty())
    })
}

/// Locates the item list under `data` and classifies each item.
pub fn unwrap_envelope(body: &[u8]) -> Result<Vec<RawItem>, SourceError> {
    let root: JsonValue = serde_json::from_slice(body)?;
    let JsonValue::Object(mut root) = root else {
        return Err(SourceError::MalformedEnvelope(
            "response body is not a JSON object".into(),
        ));
    };
    let Some(data) = root.remove("data") else {
        return Err(SourceError::MalformedEnvelope(
            "response has no \"data\" key".into(),
        ));
    };

    let values = match data {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => object_items(map),
        JsonValue::Null => {
            return Err(SourceError::MalformedEnvelope("\"data\" is null".into()))
        }
        other => {
            return Err(SourceError::MalformedEnvelope(format!(
                "\"data\" is a scalar: {other}"
            )))
        }
    };
    Ok(values.into_iter().map(RawItem::from_json).collect())
}

fn object_items(map: JsonMap<String, JsonValue>) -> Vec<JsonValue> {
    if map.is_empty() {
        return Vec::new();
    }

    // {"0": {...}, "1": {...}} is an array that went through a keyed encoder.
    let mut indexed: Vec<(usize, JsonValue)> = Vec::with_capacity(map.len());
    let mut all_indexed = true;
    for (key, value) in &map {
        match key.parse::<usize>() {
            Ok(i) => indexed.push((i, value.clone())),
            Err(_) => {
                all_indexed = false;
                break;
            }
        }
    }
    if all_indexed {
        indexed.sort_by_key(|(i, _)| *i);
        return indexed.into_iter().map(|(_, value)| value).collect();
    }

    if let Some(items) = map.values().find_map(|value| match value {
        JsonValue::Array(items) => Some(items.clone()),
        _ => None,
    }) {
        return items;
    }

    vec![JsonValue::Object(map)]
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Form, Router};

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn client_for(base: &str) -> PortalClient {
        PortalClient::new(PortalClientConfig {
            base_url: base.to_string(),
            token_path: "/sumedangkab/amel".into(),
            referer: format!("{base}/sumedangkab/amel"),
            detail_url_template: format!("{base}/detail?idPaket={{kode_rup}}"),
            user_agent: "rupsync-test".into(),
            timeout: Duration::from_secs(5),
            bulk_retry_base: Duration::from_millis(5),
            detail_retry_base: Duration::from_millis(5),
            detail_interval: Duration::from_millis(1),
            archive_dir: None,
        })
        .expect("client")
    }

    fn context() -> PortalContext {
        PortalContext {
            org_code: "D118".into(),
            active_year: "2025".into(),
        }
    }

    #[test]
    fn token_patterns_are_tried_in_order() {
        let hidden = r#"<form><input type="hidden" name="authenticityToken" value="abc123"></form>"#;
        assert_eq!(extract_token(hidden).as_deref(), Some("abc123"));

        let script = r#"<script>d.authenticityToken = 'js-token';</script>"#;
        assert_eq!(extract_token(script).as_deref(), Some("js-token"));

        let reversed = r#"<input value="rev-token" type="hidden" name="authenticityToken">"#;
        assert_eq!(extract_token(reversed).as_deref(), Some("rev-token"));

        let csrf = r#"var config = { csrf_token: "c-token" };"#;
        assert_eq!(extract_token(csrf).as_deref(), Some("c-token"));

        assert_eq!(extract_token("<html><body>maintenance</body></html>"), None);
    }

    #[test]
    fn envelope_with_data_array() {
        let items = unwrap_envelope(br#"{"data":[{"kode_rup":"12345678"},["1","2"],"teks"]}"#)
            .expect("ok");
        let shapes: Vec<_> = items.iter().map(RawItem::shape).collect();
        assert_eq!(shapes, vec!["keyed", "positional", "free_text"]);
    }

    #[test]
    fn envelope_with_index_keyed_object() {
        let items =
            unwrap_envelope(br#"{"data":{"1":{"n":"b"},"0":{"n":"a"},"10":{"n":"c"}}}"#).expect("ok");
        let names: Vec<_> = items
            .iter()
            .map(|item| match item {
                RawItem::Keyed(map) => map["n"].as_str().unwrap_or_default().to_string(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn envelope_with_nested_list_or_single_object() {
        let nested = unwrap_envelope(br#"{"data":{"recordsTotal":2,"rows":[["a"],["b"]]}}"#)
            .expect("nested");
        assert_eq!(nested.len(), 2);

        let single = unwrap_envelope(br#"{"data":{"kode_rup":"12345678"}}"#).expect("single");
        assert_eq!(single.len(), 1);
        assert!(matches!(single[0], RawItem::Keyed(_)));
    }

    #[test]
    fn malformed_envelopes_are_fatal() {
        assert!(matches!(
            unwrap_envelope(b"<html>login</html>"),
            Err(SourceError::InvalidJson(_))
        ));
        assert!(matches!(
            unwrap_envelope(br#"{"draw":1}"#),
            Err(SourceError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            unwrap_envelope(br#"{"data":"none"}"#),
            Err(SourceError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            unwrap_envelope(br#"[1,2]"#),
            Err(SourceError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn urls_are_joined_against_the_base() {
        assert_eq!(join_url("https://spse.inaproc.id/", "/a/b"), "https://spse.inaproc.id/a/b");
        assert_eq!(join_url("https://spse.inaproc.id", "a"), "https://spse.inaproc.id/a");
        assert_eq!(join_url("https://x", "https://y/z"), "https://y/z");
    }

    #[tokio::test]
    async fn token_then_endpoint_round_trip() {
        let seen_form = Arc::new(Mutex::new(HashMap::<String, String>::new()));
        let router = Router::new()
            .route(
                "/sumedangkab/amel",
                get(|| async {
                    r#"<html><script>d.authenticityToken = 'tok-42';</script></html>"#
                }),
            )
            .route(
                "/dt/perencanaan",
                post(
                    |State(seen): State<Arc<Mutex<HashMap<String, String>>>>,
                     headers: HeaderMap,
                     Form(form): Form<HashMap<String, String>>| async move {
                        let ajax = headers.get("x-requested-with").is_some();
                        if let Ok(mut guard) = seen.lock() {
                            *guard = form;
                        }
                        if ajax {
                            r#"{"data":[{"kode_rup":"12345678","nama_paket":"Renovasi Kantor"}]}"#
                        } else {
                            r#"{"error":"not ajax"}"#
                        }
                    },
                ),
            )
            .with_state(seen_form.clone());
        let base = serve(router).await;
        let client = client_for(&base);

        let token = client.acquire_token().await.expect("token");
        assert_eq!(token, "tok-42");

        let endpoint = Endpoint {
            table: "perencanaan".into(),
            path: "/dt/perencanaan".into(),
            enabled: true,
            display_name: None,
        };
        let items = client
            .fetch_endpoint(&endpoint, &token, &context())
            .await
            .expect("items");
        assert_eq!(items.len(), 1);

        let form = seen_form.lock().expect("lock").clone();
        assert_eq!(form.get("authenticityToken").map(String::as_str), Some("tok-42"));
        assert_eq!(form.get("activeInstansi").map(String::as_str), Some("D118"));
        assert_eq!(form.get("activeYear").map(String::as_str), Some("2025"));
        assert_eq!(form.get("activeSatker").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn missing_token_is_reported() {
        let router = Router::new().route("/sumedangkab/amel", get(|| async { "<html></html>" }));
        let base = serve(router).await;
        let err = client_for(&base).acquire_token().await.expect_err("no token");
        assert!(matches!(err, SourceError::TokenNotFound { .. }));
    }

    #[tokio::test]
    async fn detail_page_url_uses_the_template() {
        let router = Router::new().route(
            "/detail",
            get(|axum::extract::Query(q): axum::extract::Query<HashMap<String, String>>| async move {
                format!("<html><td>{}</td></html>", q.get("idPaket").cloned().unwrap_or_default())
            }),
        );
        let base = serve(router).await;
        let html = client_for(&base)
            .fetch_detail_page("55512345")
            .await
            .expect("detail");
        assert!(html.contains("55512345"));
    }
}

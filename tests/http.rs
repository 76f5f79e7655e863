//! HTTP-level tests: the catalog client against a fake upstream registry,
//! and the trigger server end to end.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

use registry_mirror::client::{CatalogSource, HttpCatalogClient, ServerPage};
use registry_mirror::config::{parse_config, Config, UpstreamConfig};
use registry_mirror::error::FetchError;
use registry_mirror::server::{build_router, run_server, AppState};
use registry_mirror::sync::{SyncEngine, SyncOptions};
use registry_mirror_core::store::memory::InMemoryStore;
use registry_mirror_core::RegistryStore;

// ─── Fake upstream registry ─────────────────────────────────────────

#[derive(Clone, Default)]
struct Upstream {
    pages: Arc<Vec<Vec<Value>>>,
    /// Statuses to answer with before serving real pages, one per request.
    failures: Arc<Mutex<VecDeque<u16>>>,
    seen: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl Upstream {
    fn new(pages: Vec<Vec<Value>>) -> Self {
        Self {
            pages: Arc::new(pages),
            ..Self::default()
        }
    }

    fn fail_with(self, statuses: &[u16]) -> Self {
        self.failures.lock().unwrap().extend(statuses.iter().copied());
        self
    }

    fn seen(&self) -> Vec<HashMap<String, String>> {
        self.seen.lock().unwrap().clone()
    }
}

async fn list_servers(
    State(upstream): State<Upstream>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    upstream.seen.lock().unwrap().push(params.clone());

    if let Some(code) = upstream.failures.lock().unwrap().pop_front() {
        let status = StatusCode::from_u16(code).unwrap();
        return (status, "upstream unavailable").into_response();
    }

    let index = params
        .get("cursor")
        .map(|c| c.parse::<usize>().unwrap())
        .unwrap_or(0);
    let servers = upstream.pages.get(index).cloned().unwrap_or_default();
    let next_cursor = (index + 1 < upstream.pages.len()).then(|| (index + 1).to_string());

    Json(json!({
        "servers": servers,
        "metadata": { "nextCursor": next_cursor, "count": servers.len() }
    }))
    .into_response()
}

/// Serve `upstream` on an ephemeral port and return its base URL.
async fn spawn_upstream(upstream: Upstream) -> String {
    let app = Router::new()
        .route("/v0.1/servers", get(list_servers))
        .with_state(upstream);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn installable(name: &str, updated_at: &str) -> Value {
    json!({
        "server": {
            "name": name,
            "description": "fixture",
            "version": "1.0.0",
            "remotes": [{
                "type": "streamable-http",
                "url": format!("https://{}.example/mcp", name.replace('/', "-")),
                "headers": [{ "name": "Authorization", "isSecret": true, "isRequired": true }]
            }]
        },
        "_meta": {
            "io.modelcontextprotocol.registry/official": {
                "status": "active",
                "updatedAt": updated_at,
                "isLatest": true
            }
        }
    })
}

fn upstream_config(base_url: &str, max_retries: usize) -> UpstreamConfig {
    UpstreamConfig {
        base_url: base_url.to_string(),
        max_retries,
        retry_base_ms: 1,
        ..UpstreamConfig::default()
    }
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

fn server_config(tmp: &TempDir, port: u16, upstream: &str, secret: Option<&str>) -> Config {
    let mut toml = format!(
        "[db]\npath = \"{}\"\n\n[upstream]\nbase_url = \"{}\"\nmax_retries = 0\n\n[server]\nbind = \"127.0.0.1:{}\"\n",
        tmp.path().join("registry.sqlite").display(),
        upstream,
        port
    );
    if let Some(secret) = secret {
        toml.push_str(&format!("trigger_secret = \"{}\"\n", secret));
    }
    parse_config(&toml).unwrap()
}

async fn start_trigger_server(cfg: Config) -> u16 {
    let port = cfg
        .server
        .bind
        .rsplit(':')
        .next()
        .unwrap()
        .parse()
        .unwrap();
    tokio::spawn(async move {
        run_server(&cfg).await.unwrap();
    });
    wait_for_server(port).await;
    port
}

/// Answers every page request after `delay` with one server and no cursor.
struct SlowSource {
    delay: Duration,
}

#[async_trait]
impl CatalogSource for SlowSource {
    async fn fetch_page(
        &self,
        _cursor: Option<&str>,
        _updated_since: Option<DateTime<Utc>>,
        _limit: u32,
    ) -> Result<ServerPage, FetchError> {
        tokio::time::sleep(self.delay).await;
        Ok(ServerPage {
            servers: vec![installable("io.example/slow", "2025-09-01T00:00:00Z")],
            next_cursor: None,
        })
    }
}

// ─── Client ─────────────────────────────────────────────────────────

#[tokio::test]
async fn client_sends_limit_cursor_and_watermark() {
    let upstream = Upstream::new(vec![
        vec![installable("io.example/a", "2025-09-01T00:00:00Z")],
        vec![installable("io.example/b", "2025-09-02T00:00:00Z")],
    ]);
    let base = spawn_upstream(upstream.clone()).await;
    let client = HttpCatalogClient::new(&upstream_config(&base, 0)).unwrap();
    let since: DateTime<Utc> = "2025-08-31T23:59:59Z".parse().unwrap();

    let first = client.fetch_page(None, Some(since), 250).await.unwrap();
    assert_eq!(first.servers.len(), 1);
    assert_eq!(first.next_cursor.as_deref(), Some("1"));

    let second = client
        .fetch_page(first.next_cursor.as_deref(), Some(since), 250)
        .await
        .unwrap();
    assert_eq!(second.servers[0]["server"]["name"], "io.example/b");
    assert_eq!(second.next_cursor, None);

    let seen = upstream.seen();
    assert_eq!(seen[0].get("limit").map(String::as_str), Some("100"));
    assert_eq!(seen[0].get("cursor"), None);
    assert_eq!(
        seen[0].get("updated_since").map(String::as_str),
        Some("2025-08-31T23:59:59.000000Z")
    );
    assert_eq!(seen[1].get("cursor").map(String::as_str), Some("1"));
}

#[tokio::test]
async fn client_retries_transient_statuses() {
    let upstream = Upstream::new(vec![vec![installable("io.example/a", "2025-09-01T00:00:00Z")]])
        .fail_with(&[503, 429]);
    let base = spawn_upstream(upstream.clone()).await;
    let client = HttpCatalogClient::new(&upstream_config(&base, 3)).unwrap();

    let page = client.fetch_page(None, None, 100).await.unwrap();
    assert_eq!(page.servers.len(), 1);
    assert_eq!(upstream.seen().len(), 3);
}

#[tokio::test]
async fn client_gives_up_after_max_retries() {
    let upstream = Upstream::new(vec![vec![]]).fail_with(&[502, 502, 502, 502]);
    let base = spawn_upstream(upstream.clone()).await;
    let client = HttpCatalogClient::new(&upstream_config(&base, 2)).unwrap();

    let err = client.fetch_page(None, None, 100).await.unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 502, .. }));
    assert_eq!(upstream.seen().len(), 3);
}

#[tokio::test]
async fn client_does_not_retry_client_errors() {
    let upstream = Upstream::new(vec![vec![]]).fail_with(&[404]);
    let base = spawn_upstream(upstream.clone()).await;
    let client = HttpCatalogClient::new(&upstream_config(&base, 3)).unwrap();

    let err = client.fetch_page(None, None, 100).await.unwrap_err();
    match err {
        FetchError::Status { status, body, .. } => {
            assert_eq!(status, 404);
            assert_eq!(body, "upstream unavailable");
        }
        other => panic!("expected a status error, got {:?}", other),
    }
    assert_eq!(upstream.seen().len(), 1);
}

#[tokio::test]
async fn client_rejects_non_envelope_bodies() {
    let app = Router::new().route("/v0.1/servers", get(|| async { "<html>maintenance</html>" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client =
        HttpCatalogClient::new(&upstream_config(&format!("http://{}", addr), 3)).unwrap();
    let err = client.fetch_page(None, None, 100).await.unwrap_err();
    assert!(matches!(err, FetchError::Decode { .. }));
}

// ─── Trigger server ─────────────────────────────────────────────────

#[tokio::test]
async fn trigger_requires_the_configured_secret() {
    let upstream = Upstream::new(vec![vec![
        installable("io.example/a", "2025-09-01T00:00:00Z"),
        installable("io.example/b", "2025-09-02T00:00:00Z"),
    ]]);
    let base = spawn_upstream(upstream).await;
    let tmp = TempDir::new().unwrap();
    let port = start_trigger_server(server_config(&tmp, find_free_port(), &base, Some("s3cret"))).await;

    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/api/sync", port);

    let resp = client.post(&url).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "success": false, "error": "Unauthorized" }));

    let resp = client
        .post(&url)
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(&url)
        .bearer_auth("s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["report"]["created"], 2);
    assert_eq!(body["report"]["watermark"], Value::Null);
}

#[tokio::test]
async fn trigger_reports_upstream_failure_as_500() {
    let upstream = Upstream::new(vec![vec![]]).fail_with(&[400]);
    let base = spawn_upstream(upstream).await;
    let tmp = TempDir::new().unwrap();
    let port = start_trigger_server(server_config(&tmp, find_free_port(), &base, None)).await;

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/api/sync", port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Sync failed");
    assert!(body["details"].as_str().unwrap().contains("HTTP 400"));
}

#[tokio::test]
async fn disconnected_trigger_still_finishes_and_releases_the_lease() {
    let store = Arc::new(InMemoryStore::new());
    let source = Arc::new(SlowSource {
        delay: Duration::from_millis(1500),
    });
    let options = SyncOptions::default();
    let job = options.job.clone();
    let engine = Arc::new(SyncEngine::new(store.clone(), source, options));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(AppState::new(engine, None));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let url = format!("http://{}/api/sync", addr);

    let impatient = reqwest::Client::builder()
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let err = impatient.post(&url).send().await.unwrap_err();
    assert!(err.is_timeout());

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let checkpoint = store.get_checkpoint(&job).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_outcome.as_deref(), Some("done"));
    assert_eq!(store.stats().await.unwrap().servers, 1);

    let resp = reqwest::Client::new().post(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["report"]["updated"], 1);
}

#[tokio::test]
async fn health_reports_version() {
    let base = spawn_upstream(Upstream::new(vec![vec![]])).await;
    let tmp = TempDir::new().unwrap();
    let port = start_trigger_server(server_config(&tmp, find_free_port(), &base, None)).await;

    let body: Value = reqwest::get(format!("http://127.0.0.1:{}/health", port))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

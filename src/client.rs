//! Remote catalog client.
//!
//! [`CatalogSource`] is the seam between the sync engine and the upstream
//! registry. [`HttpCatalogClient`] implements it against
//! `GET <base>/v0.1/servers`:
//!
//! ```text
//! GET /v0.1/servers?limit=100&cursor=<opaque>&updated_since=<RFC 3339>
//! → { "servers": [...], "metadata": { "nextCursor": "..." } }
//! ```
//!
//! Only the page envelope is decoded here. Each entry of `servers` is left
//! as raw JSON for the mapper, so one bad record cannot fail a whole page.
//!
//! # Retries
//!
//! Network errors, HTTP 429, and HTTP 5xx are retried with exponential
//! backoff, up to `upstream.max_retries` extra attempts. Any other non-2xx
//! status fails immediately.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use registry_mirror_core::models::ServerListResponse;

use crate::config::{UpstreamConfig, MAX_PAGE_SIZE};
use crate::error::FetchError;

const SERVERS_PATH: &str = "/v0.1/servers";
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY: usize = 512;

/// One page of the upstream server list.
#[derive(Debug, Clone, Default)]
pub struct ServerPage {
    /// Raw upstream entries, in upstream order.
    pub servers: Vec<Value>,
    /// Cursor of the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// A paginated source of upstream server descriptors.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch one page.
    ///
    /// `updated_since` restricts the page to records updated strictly after
    /// the given instant. `limit` is clamped to the upstream maximum.
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        updated_since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<ServerPage, FetchError>;
}

/// [`CatalogSource`] backed by the upstream HTTP API.
pub struct HttpCatalogClient {
    http: reqwest::Client,
    endpoint: String,
    max_retries: usize,
    retry_base_ms: u64,
}

impl HttpCatalogClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("regsync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            endpoint: format!("{}{}", config.base_url.trim_end_matches('/'), SERVERS_PATH),
            max_retries: config.max_retries,
            retry_base_ms: config.retry_base_ms,
        })
    }

    /// Full URL of the list endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        // Delays of 2, 4, 8, ... times the base.
        ExponentialBackoff::from_millis(2)
            .factor(self.retry_base_ms.max(1))
            .max_delay(MAX_BACKOFF)
            .take(self.max_retries)
    }

    async fn fetch_once(&self, query: &[(&'static str, String)]) -> Result<ServerPage, FetchError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(query)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: self.endpoint.clone(),
                source,
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| FetchError::Transport {
                url: self.endpoint.clone(),
                source,
            })?;

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: self.endpoint.clone(),
                body: truncate(body, MAX_ERROR_BODY),
            });
        }

        let envelope: ServerListResponse =
            serde_json::from_str(&body).map_err(|source| FetchError::Decode {
                url: self.endpoint.clone(),
                source,
            })?;

        Ok(ServerPage {
            servers: envelope.servers,
            next_cursor: envelope.metadata.next_cursor.filter(|c| !c.is_empty()),
        })
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogClient {
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        updated_since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<ServerPage, FetchError> {
        let query = page_query(cursor, updated_since, limit);
        debug!(endpoint = %self.endpoint, ?query, "fetching page");

        RetryIf::spawn(
            self.backoff(),
            || self.fetch_once(&query),
            |err: &FetchError| {
                let retry = err.is_transient();
                if retry {
                    warn!(error = %err, "transient upstream error, retrying");
                }
                retry
            },
        )
        .await
    }
}

/// Query parameters of one list request.
pub fn page_query(
    cursor: Option<&str>,
    updated_since: Option<DateTime<Utc>>,
    limit: u32,
) -> Vec<(&'static str, String)> {
    let mut query = vec![("limit", limit.clamp(1, MAX_PAGE_SIZE).to_string())];
    if let Some(cursor) = cursor {
        query.push(("cursor", cursor.to_string()));
    }
    if let Some(since) = updated_since {
        query.push((
            "updated_since",
            since.to_rfc3339_opts(SecondsFormat::Micros, true),
        ));
    }
    query
}

fn truncate(mut body: String, max: usize) -> String {
    if body.len() > max {
        let mut end = max;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
        body.push('…');
    }
    body
}

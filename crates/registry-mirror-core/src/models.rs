//! Data models for the registry mirror.
//!
//! Two families of types live here:
//!
//! - **Upstream wire types** ([`UpstreamServer`] and friends) describe the
//!   JSON returned by `GET /v0.1/servers` on the upstream registry. Only the
//!   fields this system interprets are typed; everything else is carried as
//!   raw [`serde_json::Value`] so new upstream fields survive a round trip.
//! - **Local records** ([`ServerRecord`] and its children) are the rows held
//!   by a [`RegistryStore`](crate::store::RegistryStore).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key of the registry-owned metadata block in an upstream `_meta` object.
pub const OFFICIAL_META_KEY: &str = "io.modelcontextprotocol.registry/official";

/// Key of the publisher-supplied metadata block in an upstream `_meta` object.
pub const PUBLISHER_META_KEY: &str = "io.modelcontextprotocol.registry/publisher-provided";

// ============ Upstream wire types ============

/// Envelope of one page returned by the upstream list endpoint.
///
/// Entries in `servers` stay untyped until the mapper decodes them, so a
/// single malformed record does not poison the whole page.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerListResponse {
    #[serde(default)]
    pub servers: Vec<Value>,
    #[serde(default)]
    pub metadata: ListMetadata,
}

/// Pagination metadata of a list response.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMetadata {
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub count: Option<u64>,
}

/// One entry of the upstream server list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamServer {
    pub server: ServerDetail,
    #[serde(rename = "_meta", default)]
    pub meta: Map<String, Value>,
}

impl UpstreamServer {
    /// Registry-owned metadata block, if present.
    pub fn official_meta(&self) -> Option<&Value> {
        self.meta.get(OFFICIAL_META_KEY)
    }

    /// Publisher metadata: the top-level block, falling back to the one
    /// nested in `server._meta`.
    pub fn publisher_meta(&self) -> Option<&Value> {
        self.meta.get(PUBLISHER_META_KEY).or_else(|| {
            self.server
                .meta
                .as_ref()
                .and_then(|m| m.get(PUBLISHER_META_KEY))
        })
    }
}

/// The `server` object of an upstream entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDetail {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub repository: Option<UpstreamRepository>,
    #[serde(default)]
    pub icons: Option<Vec<UpstreamIcon>>,
    #[serde(default)]
    pub packages: Option<Vec<UpstreamPackage>>,
    #[serde(default)]
    pub remotes: Option<Vec<UpstreamRemote>>,
    #[serde(rename = "_meta", default)]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamRepository {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub subfolder: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamIcon {
    pub src: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// An installable package (npm, pypi, oci, ...).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamPackage {
    pub registry_type: String,
    #[serde(default)]
    pub registry_base_url: Option<String>,
    pub identifier: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub file_sha256: Option<String>,
    #[serde(default)]
    pub runtime_hint: Option<String>,
    #[serde(default)]
    pub transport: Option<Value>,
    #[serde(default)]
    pub runtime_arguments: Option<Vec<Value>>,
    #[serde(default)]
    pub package_arguments: Option<Vec<Value>>,
    #[serde(default)]
    pub environment_variables: Option<Vec<UpstreamInput>>,
}

/// A named input: an environment variable of a package or a header of a remote.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_required: Option<bool>,
    #[serde(default)]
    pub is_secret: Option<bool>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub choices: Option<Vec<String>>,
}

/// A hosted endpoint of a server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamRemote {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub headers: Option<Vec<UpstreamInput>>,
}

/// The typed view of the registry-owned metadata block.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfficialMeta {
    pub status: String,
    #[serde(default)]
    pub published_at: Option<String>,
    pub updated_at: String,
    #[serde(default)]
    pub is_latest: Option<bool>,
}

// ============ Local records ============

/// Local moderation state of a mirrored server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Pending,
    Approved,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Pending => "pending",
            ServerStatus::Approved => "approved",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ServerStatus::Pending),
            "approved" => Ok(ServerStatus::Approved),
            other => anyhow::bail!("unknown server status: '{}'", other),
        }
    }
}

/// A versioned snapshot of one upstream server. Natural key: `(name, version)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    /// Upstream `title`.
    pub category: String,
    pub maintainer_name: Option<String>,
    pub maintainer_url: Option<String>,
    /// URL of the first remote, or empty when the server only ships packages.
    pub mcp_url: String,
    pub documentation_url: Option<String>,
    pub icon_url: Option<String>,
    pub authentication_type: Option<String>,
    pub dynamic_client_registration: bool,
    pub is_official: bool,
    pub status: ServerStatus,
    /// Raw upstream status, e.g. `active` or `deprecated`.
    pub mcp_status: String,
    pub is_latest: bool,
    pub publisher_meta: Option<Value>,
    pub official_meta: Option<Value>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Upstream `updatedAt`; drives the sync watermark.
    pub updated_at: DateTime<Utc>,
}

/// Source repository of a server. One per server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryRecord {
    pub id: String,
    pub server_id: String,
    pub url: String,
    pub source: String,
    pub repo_id: Option<String>,
    pub subfolder: Option<String>,
}

/// Natural key: `(server_id, registry_type, identifier, version)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageRecord {
    pub id: String,
    pub server_id: String,
    pub registry_type: String,
    pub registry_base_url: Option<String>,
    pub identifier: String,
    pub version: String,
    pub file_sha256: Option<String>,
    pub runtime_hint: Option<String>,
    pub transport: Value,
    pub runtime_arguments: Option<Value>,
    pub package_arguments: Option<Value>,
}

/// Natural key: `(package_id, name)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentVariableRecord {
    pub id: String,
    pub package_id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_required: bool,
    pub is_secret: bool,
    pub default_value: Option<String>,
    pub format: Option<String>,
    pub choices: Option<Vec<String>>,
}

/// Natural key: `(server_id, kind, url)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteRecord {
    pub id: String,
    pub server_id: String,
    /// Transport type, e.g. `streamable-http` or `sse`.
    pub kind: String,
    pub url: String,
}

/// Natural key: `(remote_id, name)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaderRecord {
    pub id: String,
    pub remote_id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_required: bool,
    pub is_secret: bool,
    pub default_value: Option<String>,
    pub format: Option<String>,
    pub choices: Option<Vec<String>>,
}

/// Persisted per-job sync state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncCheckpoint {
    pub job: String,
    /// Upper bound for the next run's watermark. Set while a run is in
    /// flight and after a run that left failed records behind.
    pub retry_floor: Option<DateTime<Utc>>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    /// `running`, `done`, or `failed`.
    pub last_outcome: Option<String>,
}

impl SyncCheckpoint {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            retry_floor: None,
            last_started_at: None,
            last_finished_at: None,
            last_outcome: None,
        }
    }
}

/// Row counts per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub servers: i64,
    pub repositories: i64,
    pub packages: i64,
    pub environment_variables: i64,
    pub remotes: i64,
    pub headers: i64,
}

//! Entity mapper: upstream descriptor → local shape.
//!
//! [`map_server`] decodes one raw entry of an upstream page and projects it
//! onto the local schema. It does no I/O; the result is handed to the
//! [`Reconciler`](crate::reconcile::Reconciler).
//!
//! # Rules
//!
//! - A descriptor with neither packages nor remotes maps to
//!   [`MapOutcome::Skip`]; there is nothing to install.
//! - Upstream status `active` becomes [`ServerStatus::Approved`]; any other
//!   value becomes [`ServerStatus::Pending`]. The raw value is kept in
//!   `mcp_status`.
//! - Packages without a `version` are dropped. Their siblings are kept.
//! - A missing server `version` defaults to `1.0.0`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::MalformedRecordError;
use crate::models::{
    OfficialMeta, ServerStatus, UpstreamInput, UpstreamPackage, UpstreamRemote, UpstreamServer,
};

const DEFAULT_VERSION: &str = "1.0.0";

/// Result of mapping one upstream entry.
#[derive(Debug, Clone, PartialEq)]
pub enum MapOutcome {
    Mapped(Box<MappedServer>),
    /// The descriptor has no installation method and is not mirrored.
    Skip { name: String },
}

/// A server projected onto the local schema, with its children, before
/// any identifiers are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedServer {
    pub name: String,
    pub version: String,
    pub description: String,
    pub category: String,
    pub maintainer_name: Option<String>,
    pub maintainer_url: Option<String>,
    pub mcp_url: String,
    pub documentation_url: Option<String>,
    pub icon_url: Option<String>,
    pub authentication_type: Option<String>,
    pub dynamic_client_registration: bool,
    pub status: ServerStatus,
    pub mcp_status: String,
    pub is_latest: bool,
    pub publisher_meta: Option<Value>,
    pub official_meta: Option<Value>,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub repository: Option<MappedRepository>,
    pub packages: Vec<MappedPackage>,
    pub remotes: Vec<MappedRemote>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedRepository {
    pub url: String,
    pub source: String,
    pub repo_id: Option<String>,
    pub subfolder: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedPackage {
    pub registry_type: String,
    pub registry_base_url: Option<String>,
    pub identifier: String,
    pub version: String,
    pub file_sha256: Option<String>,
    pub runtime_hint: Option<String>,
    pub transport: Value,
    pub runtime_arguments: Option<Value>,
    pub package_arguments: Option<Value>,
    pub environment_variables: Vec<MappedInput>,
}

/// An environment variable or header.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedInput {
    pub name: String,
    pub description: Option<String>,
    pub is_required: bool,
    pub is_secret: bool,
    pub default_value: Option<String>,
    pub format: Option<String>,
    pub choices: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedRemote {
    pub kind: String,
    pub url: String,
    pub headers: Vec<MappedInput>,
}

/// Decode and map one raw entry of an upstream page.
///
/// # Errors
///
/// Returns [`MalformedRecordError`] if the value is not a server
/// descriptor, lacks the official metadata block, or carries an
/// unparsable timestamp.
pub fn map_server(raw: &Value) -> Result<MapOutcome, MalformedRecordError> {
    let upstream: UpstreamServer = serde_json::from_value(raw.clone())?;
    map_upstream(&upstream)
}

/// Map an already-decoded upstream entry.
pub fn map_upstream(item: &UpstreamServer) -> Result<MapOutcome, MalformedRecordError> {
    let server = &item.server;

    if server.name.trim().is_empty() {
        return Err(MalformedRecordError::MissingField("server.name"));
    }

    let packages = server.packages.as_deref().unwrap_or_default();
    let remotes = server.remotes.as_deref().unwrap_or_default();
    if packages.is_empty() && remotes.is_empty() {
        return Ok(MapOutcome::Skip {
            name: server.name.clone(),
        });
    }

    let official_raw = item
        .official_meta()
        .ok_or(MalformedRecordError::MissingField("_meta.official"))?;
    let official: OfficialMeta = serde_json::from_value(official_raw.clone())?;

    let updated_at = parse_timestamp("updatedAt", &official.updated_at)?;
    let published_at = official
        .published_at
        .as_deref()
        .map(|ts| parse_timestamp("publishedAt", ts))
        .transpose()?;

    let publisher_meta = item.publisher_meta().cloned();
    let publisher_str = |key: &str| {
        publisher_meta
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .and_then(non_empty)
    };

    let repository = server.repository.as_ref().and_then(|repo| {
        let url = repo.url.as_deref().and_then(non_empty)?;
        Some(MappedRepository {
            url,
            source: repo.source.clone().unwrap_or_default(),
            repo_id: repo.id.as_deref().and_then(non_empty),
            subfolder: repo.subfolder.as_deref().and_then(non_empty),
        })
    });

    let mapped_packages = packages
        .iter()
        .filter_map(|pkg| {
            let mapped = map_package(pkg);
            if mapped.is_none() {
                debug!(
                    server = %server.name,
                    package = %pkg.identifier,
                    "dropping package without a version"
                );
            }
            mapped
        })
        .collect();

    let mapped = MappedServer {
        name: server.name.clone(),
        version: server
            .version
            .as_deref()
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        description: server.description.clone().unwrap_or_default(),
        category: server.title.clone().unwrap_or_default(),
        maintainer_name: publisher_str("maintainerName"),
        maintainer_url: publisher_str("maintainerUrl"),
        mcp_url: remotes.first().map(|r| r.url.clone()).unwrap_or_default(),
        documentation_url: server.website_url.as_deref().and_then(non_empty),
        icon_url: server
            .icons
            .as_deref()
            .and_then(|icons| icons.first())
            .and_then(|icon| non_empty(&icon.src)),
        authentication_type: publisher_str("authenticationType"),
        dynamic_client_registration: publisher_meta
            .as_ref()
            .and_then(|m| m.get("dynamicClientRegistration"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        status: derive_status(&official.status),
        mcp_status: official.status.clone(),
        is_latest: official.is_latest.unwrap_or(false),
        publisher_meta,
        official_meta: Some(official_raw.clone()),
        published_at,
        updated_at,
        repository,
        packages: mapped_packages,
        remotes: remotes.iter().map(map_remote).collect(),
    };

    Ok(MapOutcome::Mapped(Box::new(mapped)))
}

/// Collapse the upstream status vocabulary into the local moderation state.
pub fn derive_status(upstream_status: &str) -> ServerStatus {
    if upstream_status == "active" {
        ServerStatus::Approved
    } else {
        ServerStatus::Pending
    }
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(
    field: &'static str,
    value: &str,
) -> Result<DateTime<Utc>, MalformedRecordError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| MalformedRecordError::InvalidTimestamp {
            field,
            value: value.to_string(),
            source,
        })
}

fn map_package(pkg: &UpstreamPackage) -> Option<MappedPackage> {
    let version = pkg.version.as_deref().and_then(non_empty)?;
    Some(MappedPackage {
        registry_type: pkg.registry_type.clone(),
        registry_base_url: pkg.registry_base_url.as_deref().and_then(non_empty),
        identifier: pkg.identifier.clone(),
        version,
        file_sha256: pkg.file_sha256.as_deref().and_then(non_empty),
        runtime_hint: pkg.runtime_hint.as_deref().and_then(non_empty),
        transport: pkg.transport.clone().unwrap_or(Value::Null),
        runtime_arguments: pkg.runtime_arguments.clone().map(Value::Array),
        package_arguments: pkg.package_arguments.clone().map(Value::Array),
        environment_variables: pkg
            .environment_variables
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(map_input)
            .collect(),
    })
}

fn map_remote(remote: &UpstreamRemote) -> MappedRemote {
    MappedRemote {
        kind: remote.kind.clone(),
        url: remote.url.clone(),
        headers: remote
            .headers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(map_input)
            .collect(),
    }
}

fn map_input(input: &UpstreamInput) -> MappedInput {
    MappedInput {
        name: input.name.clone(),
        description: input.description.as_deref().and_then(non_empty),
        is_required: input.is_required.unwrap_or(false),
        is_secret: input.is_secret.unwrap_or(false),
        default_value: input.default.as_deref().and_then(non_empty),
        format: input.format.as_deref().and_then(non_empty),
        choices: input.choices.clone(),
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

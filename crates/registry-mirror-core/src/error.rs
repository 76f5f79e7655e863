//! Error types raised while mapping and reconciling upstream records.

use std::fmt;

use thiserror::Error;

/// An upstream record that could not be turned into a [`MappedServer`](crate::mapper::MappedServer).
///
/// Recovered at record granularity: the orchestrator logs it and moves on
/// to the next record in the page.
#[derive(Debug, Error)]
pub enum MalformedRecordError {
    /// The JSON value does not have the shape of a server descriptor.
    #[error("record does not match the server descriptor shape: {0}")]
    Decode(#[from] serde_json::Error),

    /// A field this system interprets is absent or empty.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A timestamp field is not valid RFC 3339.
    #[error("invalid timestamp in `{field}`: {value:?}")]
    InvalidTimestamp {
        field: &'static str,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// The entity level at which a write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Server,
    Repository,
    Package,
    EnvironmentVariable,
    Remote,
    Header,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Server => "server",
            EntityKind::Repository => "repository",
            EntityKind::Package => "package",
            EntityKind::EnvironmentVariable => "environment variable",
            EntityKind::Remote => "remote",
            EntityKind::Header => "header",
        };
        f.write_str(name)
    }
}

/// A store read or write failed while reconciling one server.
///
/// Aborts the current server (and its remaining children) but not the run.
#[derive(Debug, Error)]
#[error("failed to upsert {entity} {key}")]
pub struct UpsertError {
    pub entity: EntityKind,
    /// Natural key of the row being written, for diagnostics.
    pub key: String,
    #[source]
    pub source: anyhow::Error,
}

impl UpsertError {
    pub fn new(entity: EntityKind, key: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            entity,
            key: key.into(),
            source,
        }
    }
}

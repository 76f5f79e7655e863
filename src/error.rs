//! Fatal error types of a sync run.
//!
//! Record-level errors ([`MalformedRecordError`](registry_mirror_core::MalformedRecordError),
//! [`UpsertError`](registry_mirror_core::UpsertError)) live in the core crate
//! and never escape a run. The types here do: a [`FetchError`] ends the run,
//! and [`SyncError`] is what callers of [`SyncEngine::run`](crate::sync::SyncEngine::run)
//! see.

use thiserror::Error;

/// An upstream HTTP call failed after retries were exhausted.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream answered with a non-2xx status.
    #[error("upstream returned HTTP {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        /// Response body, truncated.
        body: String,
    },

    /// The request never produced a response (connect, TLS, timeout).
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The response body is not a server list envelope.
    #[error("could not decode server list from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Whether another attempt might succeed: network failures, 429, and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Transport { .. } => true,
            FetchError::Decode { .. } => false,
        }
    }
}

/// A sync run ended without reaching `Done`.
///
/// Pages committed before the failure stay applied.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching the upstream catalog failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("store operation failed: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("sync job '{job}' is already running")]
    AlreadyRunning { job: String },

    #[error("sync run exceeded its deadline of {timeout_secs}s")]
    DeadlineExceeded { timeout_secs: u64 },

    /// A duration in [`SyncOptions`](crate::sync::SyncOptions) pushes a
    /// timestamp out of the representable range.
    #[error("invalid sync options: {0}")]
    InvalidOptions(String),
}

//! # Registry Mirror Core
//!
//! Runtime-agnostic logic for mirroring the upstream MCP server registry:
//! wire models, the entity mapper, the store abstraction, and the
//! reconciler that upserts a mapped server and its children.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. The
//! application crate supplies the SQLite store, the HTTP client, and the
//! orchestration loop.

pub mod error;
pub mod mapper;
pub mod models;
pub mod reconcile;
pub mod store;

pub use error::{EntityKind, MalformedRecordError, UpsertError};
pub use mapper::{map_server, map_upstream, MapOutcome, MappedServer};
pub use reconcile::{Reconciled, Reconciler, UpsertOutcome};
pub use store::RegistryStore;

//! Storage abstraction for the registry mirror.
//!
//! The [`RegistryStore`] trait is everything the sync engine needs from the
//! persistent store: natural-key lookups, per-row writes, the watermark
//! query, checkpoints, and a lease used to keep sync runs from overlapping.
//! The engine receives a store handle explicitly; nothing reaches for a
//! global connection.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    EnvironmentVariableRecord, HeaderRecord, PackageRecord, RemoteRecord, RepositoryRecord,
    ServerRecord, StoreStats, SyncCheckpoint,
};

/// Abstract storage backend for mirrored registry data.
///
/// Every `save_*` method writes one row atomically, keyed on the entity's
/// natural key: if a row with the same natural key already exists its
/// mutable fields are overwritten and its id is kept, otherwise the record
/// is inserted with the id it carries. The resolved row id is returned.
///
/// # Operations
///
/// | Method | Natural key |
/// |--------|-------------|
/// | [`save_server`](RegistryStore::save_server) | `(name, version)` |
/// | [`save_repository`](RegistryStore::save_repository) | `server_id` |
/// | [`save_package`](RegistryStore::save_package) | `(server_id, registry_type, identifier, version)` |
/// | [`save_environment_variable`](RegistryStore::save_environment_variable) | `(package_id, name)` |
/// | [`save_remote`](RegistryStore::save_remote) | `(server_id, kind, url)` |
/// | [`save_header`](RegistryStore::save_header) | `(remote_id, name)` |
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Maximum `updated_at` across all servers, or `None` for an empty store.
    async fn latest_updated_at(&self) -> Result<Option<DateTime<Utc>>>;

    async fn find_server(&self, name: &str, version: &str) -> Result<Option<ServerRecord>>;
    async fn save_server(&self, record: &ServerRecord) -> Result<String>;

    async fn find_repository(&self, server_id: &str) -> Result<Option<RepositoryRecord>>;
    async fn save_repository(&self, record: &RepositoryRecord) -> Result<String>;

    async fn find_package(
        &self,
        server_id: &str,
        registry_type: &str,
        identifier: &str,
        version: &str,
    ) -> Result<Option<PackageRecord>>;
    async fn save_package(&self, record: &PackageRecord) -> Result<String>;

    async fn find_environment_variable(
        &self,
        package_id: &str,
        name: &str,
    ) -> Result<Option<EnvironmentVariableRecord>>;
    async fn save_environment_variable(&self, record: &EnvironmentVariableRecord)
        -> Result<String>;

    async fn find_remote(
        &self,
        server_id: &str,
        kind: &str,
        url: &str,
    ) -> Result<Option<RemoteRecord>>;
    async fn save_remote(&self, record: &RemoteRecord) -> Result<String>;

    async fn find_header(&self, remote_id: &str, name: &str) -> Result<Option<HeaderRecord>>;
    async fn save_header(&self, record: &HeaderRecord) -> Result<String>;

    /// All servers, ordered by name then version.
    async fn list_servers(&self) -> Result<Vec<ServerRecord>>;

    /// The most recently updated version of each server name, ordered by name.
    async fn latest_versions(&self) -> Result<Vec<ServerRecord>>;

    async fn list_packages(&self, server_id: &str) -> Result<Vec<PackageRecord>>;
    async fn list_environment_variables(
        &self,
        package_id: &str,
    ) -> Result<Vec<EnvironmentVariableRecord>>;
    async fn list_remotes(&self, server_id: &str) -> Result<Vec<RemoteRecord>>;
    async fn list_headers(&self, remote_id: &str) -> Result<Vec<HeaderRecord>>;

    async fn get_checkpoint(&self, job: &str) -> Result<Option<SyncCheckpoint>>;
    async fn set_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()>;

    /// Take the lease for `job` unless another holder has an unexpired one.
    ///
    /// Returns `true` if `holder` now owns the lease.
    async fn try_acquire_lease(
        &self,
        job: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop the lease for `job` if `holder` still owns it.
    async fn release_lease(&self, job: &str, holder: &str) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;
}

//! In-memory [`RegistryStore`] implementation for tests and embedding.
//!
//! All tables live behind a single `std::sync::RwLock`, so every `save_*`
//! is atomic with respect to other callers. Natural-key lookups are linear
//! scans; this store is meant for small data sets.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    EnvironmentVariableRecord, HeaderRecord, PackageRecord, RemoteRecord, RepositoryRecord,
    ServerRecord, StoreStats, SyncCheckpoint,
};

use super::RegistryStore;

#[derive(Default)]
struct Tables {
    servers: Vec<ServerRecord>,
    repositories: Vec<RepositoryRecord>,
    packages: Vec<PackageRecord>,
    environment_variables: Vec<EnvironmentVariableRecord>,
    remotes: Vec<RemoteRecord>,
    headers: Vec<HeaderRecord>,
    checkpoints: HashMap<String, SyncCheckpoint>,
    leases: HashMap<String, Lease>,
}

struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

/// Insert `record`, or overwrite the row matching `same_key` while keeping its id.
fn upsert_row<T: Clone>(
    rows: &mut Vec<T>,
    record: &T,
    same_key: impl Fn(&T) -> bool,
    id_of: impl Fn(&T) -> &str,
    with_id: impl Fn(T, String) -> T,
) -> String {
    match rows.iter_mut().find(|row| same_key(row)) {
        Some(row) => {
            let id = id_of(row).to_string();
            *row = with_id(record.clone(), id.clone());
            id
        }
        None => {
            rows.push(record.clone());
            id_of(record).to_string()
        }
    }
}

fn sorted_by<T: Clone, K: Ord>(rows: impl Iterator<Item = T>, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut out: Vec<T> = rows.collect();
    out.sort_by_key(|r| key(r));
    out
}

#[async_trait]
impl RegistryStore for InMemoryStore {
    async fn latest_updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read()?.servers.iter().map(|s| s.updated_at).max())
    }

    async fn find_server(&self, name: &str, version: &str) -> Result<Option<ServerRecord>> {
        Ok(self
            .read()?
            .servers
            .iter()
            .find(|s| s.name == name && s.version == version)
            .cloned())
    }

    async fn save_server(&self, record: &ServerRecord) -> Result<String> {
        let mut tables = self.write()?;
        Ok(upsert_row(
            &mut tables.servers,
            record,
            |s| s.name == record.name && s.version == record.version,
            |s| &s.id,
            |mut s, id| {
                s.id = id;
                s
            },
        ))
    }

    async fn find_repository(&self, server_id: &str) -> Result<Option<RepositoryRecord>> {
        Ok(self
            .read()?
            .repositories
            .iter()
            .find(|r| r.server_id == server_id)
            .cloned())
    }

    async fn save_repository(&self, record: &RepositoryRecord) -> Result<String> {
        let mut tables = self.write()?;
        Ok(upsert_row(
            &mut tables.repositories,
            record,
            |r| r.server_id == record.server_id,
            |r| &r.id,
            |mut r, id| {
                r.id = id;
                r
            },
        ))
    }

    async fn find_package(
        &self,
        server_id: &str,
        registry_type: &str,
        identifier: &str,
        version: &str,
    ) -> Result<Option<PackageRecord>> {
        Ok(self
            .read()?
            .packages
            .iter()
            .find(|p| {
                p.server_id == server_id
                    && p.registry_type == registry_type
                    && p.identifier == identifier
                    && p.version == version
            })
            .cloned())
    }

    async fn save_package(&self, record: &PackageRecord) -> Result<String> {
        let mut tables = self.write()?;
        Ok(upsert_row(
            &mut tables.packages,
            record,
            |p| {
                p.server_id == record.server_id
                    && p.registry_type == record.registry_type
                    && p.identifier == record.identifier
                    && p.version == record.version
            },
            |p| &p.id,
            |mut p, id| {
                p.id = id;
                p
            },
        ))
    }

    async fn find_environment_variable(
        &self,
        package_id: &str,
        name: &str,
    ) -> Result<Option<EnvironmentVariableRecord>> {
        Ok(self
            .read()?
            .environment_variables
            .iter()
            .find(|e| e.package_id == package_id && e.name == name)
            .cloned())
    }

    async fn save_environment_variable(
        &self,
        record: &EnvironmentVariableRecord,
    ) -> Result<String> {
        let mut tables = self.write()?;
        Ok(upsert_row(
            &mut tables.environment_variables,
            record,
            |e| e.package_id == record.package_id && e.name == record.name,
            |e| &e.id,
            |mut e, id| {
                e.id = id;
                e
            },
        ))
    }

    async fn find_remote(
        &self,
        server_id: &str,
        kind: &str,
        url: &str,
    ) -> Result<Option<RemoteRecord>> {
        Ok(self
            .read()?
            .remotes
            .iter()
            .find(|r| r.server_id == server_id && r.kind == kind && r.url == url)
            .cloned())
    }

    async fn save_remote(&self, record: &RemoteRecord) -> Result<String> {
        let mut tables = self.write()?;
        Ok(upsert_row(
            &mut tables.remotes,
            record,
            |r| r.server_id == record.server_id && r.kind == record.kind && r.url == record.url,
            |r| &r.id,
            |mut r, id| {
                r.id = id;
                r
            },
        ))
    }

    async fn find_header(&self, remote_id: &str, name: &str) -> Result<Option<HeaderRecord>> {
        Ok(self
            .read()?
            .headers
            .iter()
            .find(|h| h.remote_id == remote_id && h.name == name)
            .cloned())
    }

    async fn save_header(&self, record: &HeaderRecord) -> Result<String> {
        let mut tables = self.write()?;
        Ok(upsert_row(
            &mut tables.headers,
            record,
            |h| h.remote_id == record.remote_id && h.name == record.name,
            |h| &h.id,
            |mut h, id| {
                h.id = id;
                h
            },
        ))
    }

    async fn list_servers(&self) -> Result<Vec<ServerRecord>> {
        let tables = self.read()?;
        Ok(sorted_by(tables.servers.iter().cloned(), |s| {
            (s.name.clone(), s.version.clone())
        }))
    }

    async fn latest_versions(&self) -> Result<Vec<ServerRecord>> {
        let tables = self.read()?;
        let mut latest: HashMap<&str, &ServerRecord> = HashMap::new();
        for server in &tables.servers {
            latest
                .entry(server.name.as_str())
                .and_modify(|current| {
                    if (server.updated_at, &server.version) > (current.updated_at, &current.version)
                    {
                        *current = server;
                    }
                })
                .or_insert(server);
        }
        Ok(sorted_by(latest.into_values().cloned(), |s| s.name.clone()))
    }

    async fn list_packages(&self, server_id: &str) -> Result<Vec<PackageRecord>> {
        let tables = self.read()?;
        Ok(sorted_by(
            tables
                .packages
                .iter()
                .filter(|p| p.server_id == server_id)
                .cloned(),
            |p| (p.registry_type.clone(), p.identifier.clone(), p.version.clone()),
        ))
    }

    async fn list_environment_variables(
        &self,
        package_id: &str,
    ) -> Result<Vec<EnvironmentVariableRecord>> {
        let tables = self.read()?;
        Ok(sorted_by(
            tables
                .environment_variables
                .iter()
                .filter(|e| e.package_id == package_id)
                .cloned(),
            |e| e.name.clone(),
        ))
    }

    async fn list_remotes(&self, server_id: &str) -> Result<Vec<RemoteRecord>> {
        let tables = self.read()?;
        Ok(sorted_by(
            tables
                .remotes
                .iter()
                .filter(|r| r.server_id == server_id)
                .cloned(),
            |r| (r.kind.clone(), r.url.clone()),
        ))
    }

    async fn list_headers(&self, remote_id: &str) -> Result<Vec<HeaderRecord>> {
        let tables = self.read()?;
        Ok(sorted_by(
            tables
                .headers
                .iter()
                .filter(|h| h.remote_id == remote_id)
                .cloned(),
            |h| h.name.clone(),
        ))
    }

    async fn get_checkpoint(&self, job: &str) -> Result<Option<SyncCheckpoint>> {
        Ok(self.read()?.checkpoints.get(job).cloned())
    }

    async fn set_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        self.write()?
            .checkpoints
            .insert(checkpoint.job.clone(), checkpoint.clone());
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        job: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.write()?;
        if let Some(lease) = tables.leases.get(job) {
            if lease.holder != holder && lease.expires_at > now {
                return Ok(false);
            }
        }
        tables.leases.insert(
            job.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, job: &str, holder: &str) -> Result<()> {
        let mut tables = self.write()?;
        if tables.leases.get(job).is_some_and(|l| l.holder == holder) {
            tables.leases.remove(job);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let tables = self.read()?;
        Ok(StoreStats {
            servers: tables.servers.len() as i64,
            repositories: tables.repositories.len() as i64,
            packages: tables.packages.len() as i64,
            environment_variables: tables.environment_variables.len() as i64,
            remotes: tables.remotes.len() as i64,
            headers: tables.headers.len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn lease_excludes_other_holders_until_expiry() {
        let store = InMemoryStore::new();
        let now = Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap();
        let later = now + Duration::minutes(10);

        assert!(store.try_acquire_lease("job", "a", now, later).await.unwrap());
        assert!(!store.try_acquire_lease("job", "b", now, later).await.unwrap());
        // Expired leases can be taken over.
        assert!(store
            .try_acquire_lease("job", "b", later + Duration::seconds(1), later + Duration::minutes(10))
            .await
            .unwrap());
        // A stale holder cannot release someone else's lease.
        store.release_lease("job", "a").await.unwrap();
        assert!(!store.try_acquire_lease("job", "a", later, later).await.unwrap());
        store.release_lease("job", "b").await.unwrap();
        assert!(store.try_acquire_lease("job", "a", later, later).await.unwrap());
    }

    #[tokio::test]
    async fn save_keeps_id_of_existing_natural_key() {
        let store = InMemoryStore::new();
        let remote = RemoteRecord {
            id: "r1".to_string(),
            server_id: "s1".to_string(),
            kind: "sse".to_string(),
            url: "https://a.example".to_string(),
        };
        assert_eq!(store.save_remote(&remote).await.unwrap(), "r1");

        let again = RemoteRecord {
            id: "r2".to_string(),
            ..remote.clone()
        };
        assert_eq!(store.save_remote(&again).await.unwrap(), "r1");
        assert_eq!(store.list_remotes("s1").await.unwrap(), vec![remote]);
    }
}

//! Reconciler: natural-key upserts across the server entity graph.
//!
//! Every level follows the same steps:
//!
//! 1. Look up the existing row by natural key.
//! 2. If found, overwrite all mutable fields with the mapped values and
//!    keep the row id.
//! 3. Otherwise build a new row with a fresh UUID.
//! 4. Write it, then recurse into children with the resolved id.
//!
//! ```text
//! Server ─┬─ Repository
//!         ├─ Package ── EnvironmentVariable*
//!         └─ Remote ─── Header*
//! ```
//!
//! Children are written only after their parent, because child natural keys
//! embed the parent id. A failed write is not caught here: it surfaces as an
//! [`UpsertError`] and aborts the rest of that server. Re-running with the
//! same input converges to the same rows, so a partially applied server is
//! repaired by the next successful pass.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{EntityKind, UpsertError};
use crate::mapper::{MappedInput, MappedPackage, MappedRemote, MappedRepository, MappedServer};
use crate::models::{
    EnvironmentVariableRecord, HeaderRecord, PackageRecord, RemoteRecord, RepositoryRecord,
    ServerRecord,
};
use crate::store::RegistryStore;

/// Whether an upsert inserted a new row or overwrote an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// The server row as written, plus what happened to it.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub server: ServerRecord,
    pub outcome: UpsertOutcome,
}

/// Applies mapped servers to a [`RegistryStore`].
pub struct Reconciler<'a> {
    store: &'a dyn RegistryStore,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn RegistryStore) -> Self {
        Self { store }
    }

    /// Upsert a server and all of its children.
    pub async fn upsert_server(&self, mapped: &MappedServer) -> Result<Reconciled, UpsertError> {
        let key = format!("{}@{}", mapped.name, mapped.version);
        let fail = |e: anyhow::Error| UpsertError::new(EntityKind::Server, key.clone(), e);

        let existing = self
            .store
            .find_server(&mapped.name, &mapped.version)
            .await
            .map_err(fail)?;

        let (id, created_at, outcome) = match existing {
            Some(row) => (row.id, row.created_at, UpsertOutcome::Updated),
            None => (new_id(), Utc::now(), UpsertOutcome::Created),
        };

        let mut server = ServerRecord {
            id,
            name: mapped.name.clone(),
            version: mapped.version.clone(),
            description: mapped.description.clone(),
            category: mapped.category.clone(),
            maintainer_name: mapped.maintainer_name.clone(),
            maintainer_url: mapped.maintainer_url.clone(),
            mcp_url: mapped.mcp_url.clone(),
            documentation_url: mapped.documentation_url.clone(),
            icon_url: mapped.icon_url.clone(),
            authentication_type: mapped.authentication_type.clone(),
            dynamic_client_registration: mapped.dynamic_client_registration,
            is_official: true,
            status: mapped.status,
            mcp_status: mapped.mcp_status.clone(),
            is_latest: mapped.is_latest,
            publisher_meta: mapped.publisher_meta.clone(),
            official_meta: mapped.official_meta.clone(),
            published_at: mapped.published_at,
            created_at,
            updated_at: mapped.updated_at,
        };
        server.id = self.store.save_server(&server).await.map_err(fail)?;

        if let Some(repo) = &mapped.repository {
            self.upsert_repository(&server.id, repo).await?;
        }
        for pkg in &mapped.packages {
            self.upsert_package(&server.id, pkg).await?;
        }
        for remote in &mapped.remotes {
            self.upsert_remote(&server.id, remote).await?;
        }

        Ok(Reconciled { server, outcome })
    }

    /// Upsert the repository of `server_id`. Empty URLs are not written.
    pub async fn upsert_repository(
        &self,
        server_id: &str,
        repo: &MappedRepository,
    ) -> Result<Option<RepositoryRecord>, UpsertError> {
        if repo.url.is_empty() {
            return Ok(None);
        }
        let fail = |e: anyhow::Error| UpsertError::new(EntityKind::Repository, server_id, e);

        let id = match self.store.find_repository(server_id).await.map_err(fail)? {
            Some(row) => row.id,
            None => new_id(),
        };
        let mut record = RepositoryRecord {
            id,
            server_id: server_id.to_string(),
            url: repo.url.clone(),
            source: repo.source.clone(),
            repo_id: repo.repo_id.clone(),
            subfolder: repo.subfolder.clone(),
        };
        record.id = self.store.save_repository(&record).await.map_err(fail)?;
        Ok(Some(record))
    }

    /// Upsert one package of `server_id` and its environment variables.
    pub async fn upsert_package(
        &self,
        server_id: &str,
        pkg: &MappedPackage,
    ) -> Result<PackageRecord, UpsertError> {
        let key = format!(
            "{}:{}@{} (server {})",
            pkg.registry_type, pkg.identifier, pkg.version, server_id
        );
        let fail = |e: anyhow::Error| UpsertError::new(EntityKind::Package, key.clone(), e);

        let existing = self
            .store
            .find_package(server_id, &pkg.registry_type, &pkg.identifier, &pkg.version)
            .await
            .map_err(fail)?;

        let mut record = PackageRecord {
            id: existing.map(|row| row.id).unwrap_or_else(new_id),
            server_id: server_id.to_string(),
            registry_type: pkg.registry_type.clone(),
            registry_base_url: pkg.registry_base_url.clone(),
            identifier: pkg.identifier.clone(),
            version: pkg.version.clone(),
            file_sha256: pkg.file_sha256.clone(),
            runtime_hint: pkg.runtime_hint.clone(),
            transport: pkg.transport.clone(),
            runtime_arguments: pkg.runtime_arguments.clone(),
            package_arguments: pkg.package_arguments.clone(),
        };
        record.id = self.store.save_package(&record).await.map_err(fail)?;

        for env in &pkg.environment_variables {
            self.upsert_environment_variable(&record.id, env).await?;
        }

        Ok(record)
    }

    pub async fn upsert_environment_variable(
        &self,
        package_id: &str,
        env: &MappedInput,
    ) -> Result<EnvironmentVariableRecord, UpsertError> {
        let fail = |e: anyhow::Error| {
            UpsertError::new(
                EntityKind::EnvironmentVariable,
                format!("{} (package {})", env.name, package_id),
                e,
            )
        };

        let existing = self
            .store
            .find_environment_variable(package_id, &env.name)
            .await
            .map_err(fail)?;

        let mut record = EnvironmentVariableRecord {
            id: existing.map(|row| row.id).unwrap_or_else(new_id),
            package_id: package_id.to_string(),
            name: env.name.clone(),
            description: env.description.clone(),
            is_required: env.is_required,
            is_secret: env.is_secret,
            default_value: env.default_value.clone(),
            format: env.format.clone(),
            choices: env.choices.clone(),
        };
        record.id = self
            .store
            .save_environment_variable(&record)
            .await
            .map_err(fail)?;
        Ok(record)
    }

    /// Upsert one remote of `server_id` and its headers.
    pub async fn upsert_remote(
        &self,
        server_id: &str,
        remote: &MappedRemote,
    ) -> Result<RemoteRecord, UpsertError> {
        let key = format!("{} {} (server {})", remote.kind, remote.url, server_id);
        let fail = |e: anyhow::Error| UpsertError::new(EntityKind::Remote, key.clone(), e);

        let existing = self
            .store
            .find_remote(server_id, &remote.kind, &remote.url)
            .await
            .map_err(fail)?;

        let mut record = RemoteRecord {
            id: existing.map(|row| row.id).unwrap_or_else(new_id),
            server_id: server_id.to_string(),
            kind: remote.kind.clone(),
            url: remote.url.clone(),
        };
        record.id = self.store.save_remote(&record).await.map_err(fail)?;

        for header in &remote.headers {
            self.upsert_header(&record.id, header).await?;
        }

        Ok(record)
    }

    pub async fn upsert_header(
        &self,
        remote_id: &str,
        header: &MappedInput,
    ) -> Result<HeaderRecord, UpsertError> {
        let fail = |e: anyhow::Error| {
            UpsertError::new(
                EntityKind::Header,
                format!("{} (remote {})", header.name, remote_id),
                e,
            )
        };

        let existing = self
            .store
            .find_header(remote_id, &header.name)
            .await
            .map_err(fail)?;

        let mut record = HeaderRecord {
            id: existing.map(|row| row.id).unwrap_or_else(new_id),
            remote_id: remote_id.to_string(),
            name: header.name.clone(),
            description: header.description.clone(),
            is_required: header.is_required,
            is_secret: header.is_secret,
            default_value: header.default_value.clone(),
            format: header.format.clone(),
            choices: header.choices.clone(),
        };
        record.id = self.store.save_header(&record).await.map_err(fail)?;
        Ok(record)
    }
}

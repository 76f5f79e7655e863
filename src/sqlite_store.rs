//! SQLite-backed [`RegistryStore`] implementation.
//!
//! Each `save_*` is a single `INSERT ... ON CONFLICT(<natural key>) DO
//! UPDATE ... RETURNING id`, so a write is atomic per row and two writers
//! racing on the same natural key cannot produce duplicates. No statement
//! spans more than one row.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use registry_mirror_core::models::{
    EnvironmentVariableRecord, HeaderRecord, PackageRecord, RemoteRecord, RepositoryRecord,
    ServerRecord, StoreStats, SyncCheckpoint,
};
use registry_mirror_core::store::RegistryStore;

/// SQLite implementation of the [`RegistryStore`] trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const SERVER_COLUMNS: &str = "id, name, version, description, category, maintainer_name, \
    maintainer_url, mcp_url, documentation_url, icon_url, authentication_type, \
    dynamic_client_registration, is_official, status, mcp_status, is_latest, publisher_meta, \
    official_meta, published_at, created_at, updated_at";

const INPUT_COLUMNS: &str =
    "id, name, description, is_required, is_secret, default_value, format, choices";

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| anyhow!("timestamp out of range: {}", micros))
}

fn opt_from_micros(micros: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    micros.map(from_micros).transpose()
}

fn json_text(value: Option<&Value>) -> Result<Option<String>> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn parse_json(text: Option<String>) -> Result<Option<Value>> {
    text.map(|t| serde_json::from_str(&t))
        .transpose()
        .map_err(Into::into)
}

fn choices_text(choices: Option<&Vec<String>>) -> Result<Option<String>> {
    choices.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn parse_choices(text: Option<String>) -> Result<Option<Vec<String>>> {
    text.map(|t| serde_json::from_str(&t))
        .transpose()
        .map_err(Into::into)
}

fn server_from_row(row: &SqliteRow) -> Result<ServerRecord> {
    let status: String = row.try_get("status")?;
    Ok(ServerRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        maintainer_name: row.try_get("maintainer_name")?,
        maintainer_url: row.try_get("maintainer_url")?,
        mcp_url: row.try_get("mcp_url")?,
        documentation_url: row.try_get("documentation_url")?,
        icon_url: row.try_get("icon_url")?,
        authentication_type: row.try_get("authentication_type")?,
        dynamic_client_registration: row.try_get("dynamic_client_registration")?,
        is_official: row.try_get("is_official")?,
        status: status.parse()?,
        mcp_status: row.try_get("mcp_status")?,
        is_latest: row.try_get("is_latest")?,
        publisher_meta: parse_json(row.try_get("publisher_meta")?)?,
        official_meta: parse_json(row.try_get("official_meta")?)?,
        published_at: opt_from_micros(row.try_get("published_at")?)?,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

fn repository_from_row(row: &SqliteRow) -> Result<RepositoryRecord> {
    Ok(RepositoryRecord {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        url: row.try_get("url")?,
        source: row.try_get("source")?,
        repo_id: row.try_get("repo_id")?,
        subfolder: row.try_get("subfolder")?,
    })
}

fn package_from_row(row: &SqliteRow) -> Result<PackageRecord> {
    let transport: String = row.try_get("transport")?;
    Ok(PackageRecord {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        registry_type: row.try_get("registry_type")?,
        registry_base_url: row.try_get("registry_base_url")?,
        identifier: row.try_get("identifier")?,
        version: row.try_get("version")?,
        file_sha256: row.try_get("file_sha256")?,
        runtime_hint: row.try_get("runtime_hint")?,
        transport: serde_json::from_str(&transport)?,
        runtime_arguments: parse_json(row.try_get("runtime_arguments")?)?,
        package_arguments: parse_json(row.try_get("package_arguments")?)?,
    })
}

fn environment_variable_from_row(row: &SqliteRow) -> Result<EnvironmentVariableRecord> {
    Ok(EnvironmentVariableRecord {
        id: row.try_get("id")?,
        package_id: row.try_get("package_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        is_required: row.try_get("is_required")?,
        is_secret: row.try_get("is_secret")?,
        default_value: row.try_get("default_value")?,
        format: row.try_get("format")?,
        choices: parse_choices(row.try_get("choices")?)?,
    })
}

fn remote_from_row(row: &SqliteRow) -> Result<RemoteRecord> {
    Ok(RemoteRecord {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        kind: row.try_get("kind")?,
        url: row.try_get("url")?,
    })
}

fn header_from_row(row: &SqliteRow) -> Result<HeaderRecord> {
    Ok(HeaderRecord {
        id: row.try_get("id")?,
        remote_id: row.try_get("remote_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        is_required: row.try_get("is_required")?,
        is_secret: row.try_get("is_secret")?,
        default_value: row.try_get("default_value")?,
        format: row.try_get("format")?,
        choices: parse_choices(row.try_get("choices")?)?,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<SyncCheckpoint> {
    Ok(SyncCheckpoint {
        job: row.try_get("job")?,
        retry_floor: opt_from_micros(row.try_get("retry_floor")?)?,
        last_started_at: opt_from_micros(row.try_get("last_started_at")?)?,
        last_finished_at: opt_from_micros(row.try_get("last_finished_at")?)?,
        last_outcome: row.try_get("last_outcome")?,
    })
}

fn collect<T>(rows: &[SqliteRow], f: fn(&SqliteRow) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(f).collect()
}

#[async_trait]
impl RegistryStore for SqliteStore {
    async fn latest_updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(updated_at) FROM servers")
            .fetch_one(&self.pool)
            .await?;
        opt_from_micros(max)
    }

    async fn find_server(&self, name: &str, version: &str) -> Result<Option<ServerRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM servers WHERE name = ? AND version = ?",
            SERVER_COLUMNS
        ))
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(server_from_row).transpose()
    }

    async fn save_server(&self, record: &ServerRecord) -> Result<String> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO servers (id, name, version, description, category, maintainer_name,
                                 maintainer_url, mcp_url, documentation_url, icon_url,
                                 authentication_type, dynamic_client_registration, is_official,
                                 status, mcp_status, is_latest, publisher_meta, official_meta,
                                 published_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name, version) DO UPDATE SET
                description = excluded.description,
                category = excluded.category,
                maintainer_name = excluded.maintainer_name,
                maintainer_url = excluded.maintainer_url,
                mcp_url = excluded.mcp_url,
                documentation_url = excluded.documentation_url,
                icon_url = excluded.icon_url,
                authentication_type = excluded.authentication_type,
                dynamic_client_registration = excluded.dynamic_client_registration,
                is_official = excluded.is_official,
                status = excluded.status,
                mcp_status = excluded.mcp_status,
                is_latest = excluded.is_latest,
                publisher_meta = excluded.publisher_meta,
                official_meta = excluded.official_meta,
                published_at = excluded.published_at,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.version)
        .bind(&record.description)
        .bind(&record.category)
        .bind(&record.maintainer_name)
        .bind(&record.maintainer_url)
        .bind(&record.mcp_url)
        .bind(&record.documentation_url)
        .bind(&record.icon_url)
        .bind(&record.authentication_type)
        .bind(record.dynamic_client_registration)
        .bind(record.is_official)
        .bind(record.status.as_str())
        .bind(&record.mcp_status)
        .bind(record.is_latest)
        .bind(json_text(record.publisher_meta.as_ref())?)
        .bind(json_text(record.official_meta.as_ref())?)
        .bind(record.published_at.map(to_micros))
        .bind(to_micros(record.created_at))
        .bind(to_micros(record.updated_at))
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn find_repository(&self, server_id: &str) -> Result<Option<RepositoryRecord>> {
        let row = sqlx::query(
            "SELECT id, server_id, url, source, repo_id, subfolder FROM repositories WHERE server_id = ?",
        )
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(repository_from_row).transpose()
    }

    async fn save_repository(&self, record: &RepositoryRecord) -> Result<String> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO repositories (id, server_id, url, source, repo_id, subfolder)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(server_id) DO UPDATE SET
                url = excluded.url,
                source = excluded.source,
                repo_id = excluded.repo_id,
                subfolder = excluded.subfolder
            RETURNING id
            "#,
        )
        .bind(&record.id)
        .bind(&record.server_id)
        .bind(&record.url)
        .bind(&record.source)
        .bind(&record.repo_id)
        .bind(&record.subfolder)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn find_package(
        &self,
        server_id: &str,
        registry_type: &str,
        identifier: &str,
        version: &str,
    ) -> Result<Option<PackageRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM packages
            WHERE server_id = ? AND registry_type = ? AND identifier = ? AND version = ?
            "#,
        )
        .bind(server_id)
        .bind(registry_type)
        .bind(identifier)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(package_from_row).transpose()
    }

    async fn save_package(&self, record: &PackageRecord) -> Result<String> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO packages (id, server_id, registry_type, registry_base_url, identifier,
                                  version, file_sha256, runtime_hint, transport,
                                  runtime_arguments, package_arguments)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(server_id, registry_type, identifier, version) DO UPDATE SET
                registry_base_url = excluded.registry_base_url,
                file_sha256 = excluded.file_sha256,
                runtime_hint = excluded.runtime_hint,
                transport = excluded.transport,
                runtime_arguments = excluded.runtime_arguments,
                package_arguments = excluded.package_arguments
            RETURNING id
            "#,
        )
        .bind(&record.id)
        .bind(&record.server_id)
        .bind(&record.registry_type)
        .bind(&record.registry_base_url)
        .bind(&record.identifier)
        .bind(&record.version)
        .bind(&record.file_sha256)
        .bind(&record.runtime_hint)
        .bind(serde_json::to_string(&record.transport)?)
        .bind(json_text(record.runtime_arguments.as_ref())?)
        .bind(json_text(record.package_arguments.as_ref())?)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn find_environment_variable(
        &self,
        package_id: &str,
        name: &str,
    ) -> Result<Option<EnvironmentVariableRecord>> {
        let row = sqlx::query(&format!(
            "SELECT package_id, {} FROM environment_variables WHERE package_id = ? AND name = ?",
            INPUT_COLUMNS
        ))
        .bind(package_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(environment_variable_from_row).transpose()
    }

    async fn save_environment_variable(
        &self,
        record: &EnvironmentVariableRecord,
    ) -> Result<String> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO environment_variables (id, package_id, name, description, is_required,
                                               is_secret, default_value, format, choices)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(package_id, name) DO UPDATE SET
                description = excluded.description,
                is_required = excluded.is_required,
                is_secret = excluded.is_secret,
                default_value = excluded.default_value,
                format = excluded.format,
                choices = excluded.choices
            RETURNING id
            "#,
        )
        .bind(&record.id)
        .bind(&record.package_id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(record.is_required)
        .bind(record.is_secret)
        .bind(&record.default_value)
        .bind(&record.format)
        .bind(choices_text(record.choices.as_ref())?)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn find_remote(
        &self,
        server_id: &str,
        kind: &str,
        url: &str,
    ) -> Result<Option<RemoteRecord>> {
        let row = sqlx::query(
            "SELECT id, server_id, kind, url FROM remotes WHERE server_id = ? AND kind = ? AND url = ?",
        )
        .bind(server_id)
        .bind(kind)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(remote_from_row).transpose()
    }

    async fn save_remote(&self, record: &RemoteRecord) -> Result<String> {
        // Every column but the id is part of the natural key, so a conflict
        // has nothing to overwrite; the no-op update makes RETURNING fire.
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO remotes (id, server_id, kind, url)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(server_id, kind, url) DO UPDATE SET url = excluded.url
            RETURNING id
            "#,
        )
        .bind(&record.id)
        .bind(&record.server_id)
        .bind(&record.kind)
        .bind(&record.url)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn find_header(&self, remote_id: &str, name: &str) -> Result<Option<HeaderRecord>> {
        let row = sqlx::query(&format!(
            "SELECT remote_id, {} FROM headers WHERE remote_id = ? AND name = ?",
            INPUT_COLUMNS
        ))
        .bind(remote_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(header_from_row).transpose()
    }

    async fn save_header(&self, record: &HeaderRecord) -> Result<String> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO headers (id, remote_id, name, description, is_required, is_secret,
                                 default_value, format, choices)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(remote_id, name) DO UPDATE SET
                description = excluded.description,
                is_required = excluded.is_required,
                is_secret = excluded.is_secret,
                default_value = excluded.default_value,
                format = excluded.format,
                choices = excluded.choices
            RETURNING id
            "#,
        )
        .bind(&record.id)
        .bind(&record.remote_id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(record.is_required)
        .bind(record.is_secret)
        .bind(&record.default_value)
        .bind(&record.format)
        .bind(choices_text(record.choices.as_ref())?)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn list_servers(&self) -> Result<Vec<ServerRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM servers ORDER BY name ASC, version ASC",
            SERVER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, server_from_row)
    }

    async fn latest_versions(&self) -> Result<Vec<ServerRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM servers s
            WHERE NOT EXISTS (
                SELECT 1 FROM servers t
                WHERE t.name = s.name
                  AND (t.updated_at > s.updated_at
                       OR (t.updated_at = s.updated_at AND t.version > s.version))
            )
            ORDER BY s.name ASC
            "#,
            SERVER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, server_from_row)
    }

    async fn list_packages(&self, server_id: &str) -> Result<Vec<PackageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM packages WHERE server_id = ?
            ORDER BY registry_type ASC, identifier ASC, version ASC
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, package_from_row)
    }

    async fn list_environment_variables(
        &self,
        package_id: &str,
    ) -> Result<Vec<EnvironmentVariableRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT package_id, {} FROM environment_variables WHERE package_id = ? ORDER BY name ASC",
            INPUT_COLUMNS
        ))
        .bind(package_id)
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, environment_variable_from_row)
    }

    async fn list_remotes(&self, server_id: &str) -> Result<Vec<RemoteRecord>> {
        let rows = sqlx::query(
            "SELECT id, server_id, kind, url FROM remotes WHERE server_id = ? ORDER BY kind ASC, url ASC",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, remote_from_row)
    }

    async fn list_headers(&self, remote_id: &str) -> Result<Vec<HeaderRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT remote_id, {} FROM headers WHERE remote_id = ? ORDER BY name ASC",
            INPUT_COLUMNS
        ))
        .bind(remote_id)
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, header_from_row)
    }

    async fn get_checkpoint(&self, job: &str) -> Result<Option<SyncCheckpoint>> {
        let row = sqlx::query(
            r#"
            SELECT job, retry_floor, last_started_at, last_finished_at, last_outcome
            FROM sync_checkpoints WHERE job = ?
            "#,
        )
        .bind(job)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn set_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (job, retry_floor, last_started_at, last_finished_at, last_outcome)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(job) DO UPDATE SET
                retry_floor = excluded.retry_floor,
                last_started_at = excluded.last_started_at,
                last_finished_at = excluded.last_finished_at,
                last_outcome = excluded.last_outcome
            "#,
        )
        .bind(&checkpoint.job)
        .bind(checkpoint.retry_floor.map(to_micros))
        .bind(checkpoint.last_started_at.map(to_micros))
        .bind(checkpoint.last_finished_at.map(to_micros))
        .bind(&checkpoint.last_outcome)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        job: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_leases (job, holder, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(job) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE sync_leases.holder = excluded.holder OR sync_leases.expires_at <= ?
            "#,
        )
        .bind(job)
        .bind(holder)
        .bind(to_micros(expires_at))
        .bind(to_micros(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, job: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_leases WHERE job = ? AND holder = ?")
            .bind(job)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM servers) AS servers,
                (SELECT COUNT(*) FROM repositories) AS repositories,
                (SELECT COUNT(*) FROM packages) AS packages,
                (SELECT COUNT(*) FROM environment_variables) AS environment_variables,
                (SELECT COUNT(*) FROM remotes) AS remotes,
                (SELECT COUNT(*) FROM headers) AS headers
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            servers: row.try_get("servers")?,
            repositories: row.try_get("repositories")?,
            packages: row.try_get("packages")?,
            environment_variables: row.try_get("environment_variables")?,
            remotes: row.try_get("remotes")?,
            headers: row.try_get("headers")?,
        })
    }
}

//! Database schema migrations.
//!
//! Every statement is `IF NOT EXISTS`, so running `regsync init` (or
//! starting the server) any number of times is safe.
//!
//! Timestamps are stored as INTEGER microseconds since the Unix epoch so the
//! watermark survives a round trip without losing upstream precision.
//! JSON passthrough fields are stored as TEXT.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS servers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        version TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        category TEXT NOT NULL DEFAULT '',
        maintainer_name TEXT,
        maintainer_url TEXT,
        mcp_url TEXT NOT NULL DEFAULT '',
        documentation_url TEXT,
        icon_url TEXT,
        authentication_type TEXT,
        dynamic_client_registration INTEGER NOT NULL DEFAULT 0,
        is_official INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL DEFAULT 'pending',
        mcp_status TEXT NOT NULL DEFAULT '',
        is_latest INTEGER NOT NULL DEFAULT 0,
        publisher_meta TEXT,
        official_meta TEXT,
        published_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(name, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repositories (
        id TEXT PRIMARY KEY,
        server_id TEXT NOT NULL UNIQUE,
        url TEXT NOT NULL,
        source TEXT NOT NULL DEFAULT '',
        repo_id TEXT,
        subfolder TEXT,
        FOREIGN KEY (server_id) REFERENCES servers(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS packages (
        id TEXT PRIMARY KEY,
        server_id TEXT NOT NULL,
        registry_type TEXT NOT NULL,
        registry_base_url TEXT,
        identifier TEXT NOT NULL,
        version TEXT NOT NULL,
        file_sha256 TEXT,
        runtime_hint TEXT,
        transport TEXT NOT NULL DEFAULT 'null',
        runtime_arguments TEXT,
        package_arguments TEXT,
        UNIQUE(server_id, registry_type, identifier, version),
        FOREIGN KEY (server_id) REFERENCES servers(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS environment_variables (
        id TEXT PRIMARY KEY,
        package_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        is_required INTEGER NOT NULL DEFAULT 0,
        is_secret INTEGER NOT NULL DEFAULT 0,
        default_value TEXT,
        format TEXT,
        choices TEXT,
        UNIQUE(package_id, name),
        FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS remotes (
        id TEXT PRIMARY KEY,
        server_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        url TEXT NOT NULL,
        UNIQUE(server_id, kind, url),
        FOREIGN KEY (server_id) REFERENCES servers(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS headers (
        id TEXT PRIMARY KEY,
        remote_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        is_required INTEGER NOT NULL DEFAULT 0,
        is_secret INTEGER NOT NULL DEFAULT 0,
        default_value TEXT,
        format TEXT,
        choices TEXT,
        UNIQUE(remote_id, name),
        FOREIGN KEY (remote_id) REFERENCES remotes(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_checkpoints (
        job TEXT PRIMARY KEY,
        retry_floor INTEGER,
        last_started_at INTEGER,
        last_finished_at INTEGER,
        last_outcome TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_leases (
        job TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_servers_updated_at ON servers(updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_servers_name ON servers(name)",
    "CREATE INDEX IF NOT EXISTS idx_packages_server_id ON packages(server_id)",
    "CREATE INDEX IF NOT EXISTS idx_remotes_server_id ON remotes(server_id)",
];

/// Create all tables and indexes on an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Open the configured database, create the schema, and close the pool.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

//! Local mirror overview for operators.
//!
//! `regsync status` prints row counts, the current watermark, and the state
//! of the sync checkpoint. `regsync latest` lists the newest version of each
//! mirrored server name.

use anyhow::Result;
use chrono::{DateTime, Utc};

use registry_mirror_core::models::SyncCheckpoint;
use registry_mirror_core::RegistryStore;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

/// Run the status command: query the database and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = SqliteStore::new(pool.clone());

    let stats = store.stats().await?;
    let latest = store.latest_updated_at().await?;
    let checkpoint = store.get_checkpoint(&config.sync.job).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Registry Mirror Status");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Upstream:    {}", config.upstream.base_url);
    println!();
    println!("  Servers:     {}", stats.servers);
    println!("  Repos:       {}", stats.repositories);
    println!("  Packages:    {}", stats.packages);
    println!("  Env vars:    {}", stats.environment_variables);
    println!("  Remotes:     {}", stats.remotes);
    println!("  Headers:     {}", stats.headers);
    println!();
    println!("  Latest update: {}", format_opt(latest));

    print_checkpoint(&config.sync.job, checkpoint.as_ref());
    println!();

    pool.close().await;
    Ok(())
}

fn print_checkpoint(job: &str, checkpoint: Option<&SyncCheckpoint>) {
    println!();
    println!("  Job '{}':", job);
    let Some(cp) = checkpoint else {
        println!("    never run");
        return;
    };
    println!(
        "    Last outcome:  {}",
        cp.last_outcome.as_deref().unwrap_or("unknown")
    );
    println!("    Started:       {}", format_opt(cp.last_started_at));
    println!("    Finished:      {}", format_opt(cp.last_finished_at));
    if let Some(floor) = cp.retry_floor {
        println!("    Retry floor:   {}", format_ts(floor));
    }
}

/// Run the latest command: print the newest version of each server name.
pub async fn run_latest(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = SqliteStore::new(pool.clone());

    let servers = store.latest_versions().await?;
    if servers.is_empty() {
        println!("No servers mirrored yet. Run `regsync sync` first.");
    } else {
        println!(
            "{:<48} {:<14} {:<9} {:<11} {}",
            "NAME", "VERSION", "STATUS", "UPSTREAM", "UPDATED"
        );
        println!("{}", "-".repeat(104));
        for s in &servers {
            println!(
                "{:<48} {:<14} {:<9} {:<11} {}",
                s.name,
                s.version,
                s.status,
                s.mcp_status,
                format_ts(s.updated_at)
            );
        }
        println!();
        println!("{} server(s)", servers.len());
    }

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn format_opt(ts: Option<DateTime<Utc>>) -> String {
    ts.map(format_ts).unwrap_or_else(|| "never".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formats_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn formats_missing_timestamps_as_never() {
        assert_eq!(format_opt(None), "never");
        let ts = Utc.with_ymd_and_hms(2025, 9, 1, 8, 5, 0).unwrap();
        assert_eq!(format_opt(Some(ts)), "2025-09-01 08:05:00 UTC");
    }
}

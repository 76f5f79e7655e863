//! # Registry Mirror CLI (`regsync`)
//!
//! ## Usage
//!
//! ```bash
//! regsync --config ./config/regsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `regsync init` | Create the SQLite database and run schema migrations |
//! | `regsync sync` | Run one incremental sync pass and print its report |
//! | `regsync serve` | Start the HTTP trigger server |
//! | `regsync status` | Print row counts, watermark, and checkpoint state |
//! | `regsync latest` | List the newest version of each mirrored server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use registry_mirror::{config, migrate, server, status, sync};

/// Registry Mirror: incrementally mirror the MCP server registry into SQLite.
#[derive(Parser)]
#[command(name = "regsync", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/regsync.toml")]
    config: PathBuf,

    /// Log filter, e.g. `info` or `registry_mirror=debug`. `RUST_LOG` wins
    /// when set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Run one sync pass against the upstream registry.
    ///
    /// Fetches every server updated since the local watermark and upserts it
    /// with its repository, packages, remotes, and their inputs.
    Sync,

    /// Start the HTTP trigger server (`POST /api/sync`, `GET /health`).
    Serve,

    /// Show row counts, the watermark, and the last run's checkpoint.
    Status,

    /// List the newest version of each mirrored server name.
    Latest,
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Sync => {
            let report = sync::run_sync(&cfg).await?;
            println!("sync {}", report.job);
            match report.watermark {
                Some(w) => println!("  updated_since: {}", w.to_rfc3339()),
                None => println!("  updated_since: (full sync)"),
            }
            println!("  pages:     {}", report.pages);
            println!("  fetched:   {}", report.fetched);
            println!("  created:   {}", report.created);
            println!("  updated:   {}", report.updated);
            println!("  skipped:   {}", report.skipped);
            println!("  malformed: {}", report.malformed);
            println!("  failed:    {}", report.failed.len());
            for failure in &report.failed {
                println!(
                    "    {}@{}: {}",
                    failure.name, failure.version, failure.error
                );
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::Latest => {
            status::run_latest(&cfg).await?;
        }
    }

    Ok(())
}

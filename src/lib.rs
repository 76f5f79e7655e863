//! # Registry Mirror
//!
//! Incrementally mirrors the upstream MCP server registry into a local
//! SQLite database.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │   Upstream   │──▶│   Mapper    │──▶│  Reconciler  │──▶│  SQLite  │
//! │ /v0.1/servers│   │ (per record)│   │ natural keys │   │  (WAL)   │
//! └──────────────┘   └─────────────┘   └──────────────┘   └────┬─────┘
//!        ▲                                                     │
//!        └──────────── updated_since = watermark ◀─────────────┘
//! ```
//!
//! The mapper, reconciler, and store trait live in
//! [`registry_mirror_core`]; this crate adds the SQLite store, the HTTP
//! client, the orchestration loop, and the `regsync` CLI and trigger server.
//!
//! ## Quick Start
//!
//! ```bash
//! regsync init                  # create database
//! regsync sync                  # run one incremental pass
//! regsync latest                # newest version of every server
//! regsync serve                 # POST /api/sync trigger endpoint
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`client`] | Upstream catalog client |
//! | [`sync`] | Sync orchestrator and watermark |
//! | [`sqlite_store`] | SQLite `RegistryStore` |
//! | [`server`] | HTTP trigger server |
//! | [`status`] | Operator overview commands |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Fetch and sync errors |

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod server;
pub mod sqlite_store;
pub mod status;
pub mod sync;

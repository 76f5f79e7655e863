//! Sync orchestrator.
//!
//! One call to [`SyncEngine::run`] is one sync pass:
//!
//! ```text
//! acquire lease
//!   → compute watermark, record it as the checkpoint floor
//!   → loop { fetch page → map → reconcile each record } until no cursor
//!   → finalize checkpoint
//! release lease
//! ```
//!
//! Records are processed one at a time, in page order. A record that fails
//! to map or to reconcile is logged and skipped; a page that cannot be
//! fetched ends the run. Every row write is durable on its own, so a run
//! that stops midway leaves earlier pages applied and the next run picks
//! up from the checkpoint floor.
//!
//! # Watermark
//!
//! The `updated_since` sent upstream is
//!
//! ```text
//! min(latest local updatedAt, checkpoint floor, run start) - margin
//! ```
//!
//! The floor is lowered to the watermark when a run starts and, once the
//! run completes, set to the oldest `updatedAt` among records that failed
//! to reconcile (or cleared). A failed record therefore stays inside the
//! window of every following run until it is applied.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use registry_mirror_core::models::SyncCheckpoint;
use registry_mirror_core::{map_server, MapOutcome, Reconciler, RegistryStore, UpsertOutcome};

use crate::client::{CatalogSource, HttpCatalogClient};
use crate::config::{Config, SyncConfig, MAX_DURATION_SECS};
use crate::error::SyncError;
use crate::sqlite_store::SqliteStore;

/// Checkpoint floor meaning "nothing has been fully synced yet": the Unix
/// epoch.
fn full_sync_floor() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

const OUTCOME_RUNNING: &str = "running";
const OUTCOME_DONE: &str = "done";
const OUTCOME_FAILED: &str = "failed";

/// Tunables of a [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub job: String,
    pub page_size: u32,
    pub run_timeout: Duration,
    pub watermark_margin: chrono::Duration,
    pub lease_ttl: chrono::Duration,
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.sync, config.upstream.page_size)
    }

    fn new(sync: &SyncConfig, page_size: u32) -> Self {
        Self {
            job: sync.job.clone(),
            page_size,
            run_timeout: Duration::from_secs(sync.run_timeout_secs),
            watermark_margin: seconds(sync.watermark_margin_secs),
            lease_ttl: seconds(sync.lease_ttl_secs),
        }
    }
}

/// Config values are bounded by [`MAX_DURATION_SECS`], so the clamp only
/// applies to configs that skipped validation.
fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new(&SyncConfig::default(), crate::config::MAX_PAGE_SIZE)
    }
}

/// A record that was fetched but not applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub name: String,
    pub version: String,
    pub updated_at: DateTime<Utc>,
    pub error: String,
}

/// Summary of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub job: String,
    /// The `updated_since` sent upstream; `None` for a full sync.
    pub watermark: Option<DateTime<Utc>>,
    pub pages: u32,
    pub fetched: u64,
    /// Descriptors with neither packages nor remotes.
    pub skipped: u64,
    /// Records that could not be mapped.
    pub malformed: u64,
    pub created: u64,
    pub updated: u64,
    /// Records that mapped but failed to reconcile.
    pub failed: Vec<RecordFailure>,
}

impl SyncReport {
    fn new(job: &str, watermark: Option<DateTime<Utc>>) -> Self {
        Self {
            job: job.to_string(),
            watermark,
            ..Self::default()
        }
    }

    /// Servers written in this pass.
    pub fn applied(&self) -> u64 {
        self.created + self.updated
    }

    fn oldest_failure(&self) -> Option<DateTime<Utc>> {
        self.failed.iter().map(|f| f.updated_at).min()
    }
}

/// Compute the `updated_since` filter for a run starting at `run_start`.
///
/// Returns `None` when a full sync is needed: the store is empty and there
/// is no floor, the floor is the full-sync marker, or the margin reaches
/// past the earliest representable time.
pub fn compute_watermark(
    latest_updated_at: Option<DateTime<Utc>>,
    retry_floor: Option<DateTime<Utc>>,
    run_start: DateTime<Utc>,
    margin: chrono::Duration,
) -> Option<DateTime<Utc>> {
    let bound = match (latest_updated_at, retry_floor) {
        (None, None) => return None,
        (Some(latest), None) => latest,
        (None, Some(floor)) => floor,
        (Some(latest), Some(floor)) => latest.min(floor),
    };
    if bound <= full_sync_floor() {
        return None;
    }
    bound.min(run_start).checked_sub_signed(margin)
}

/// Drives sync passes against an injected store and catalog source.
pub struct SyncEngine {
    store: Arc<dyn RegistryStore>,
    source: Arc<dyn CatalogSource>,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        source: Arc<dyn CatalogSource>,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            source,
            options,
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Run one sync pass.
    ///
    /// Fails with [`SyncError::AlreadyRunning`] if another pass holds the
    /// lease for this job, and with [`SyncError::DeadlineExceeded`] if the
    /// pass outlives `run_timeout`.
    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let job = self.options.job.as_str();
        let holder = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let expires_at = started_at
            .checked_add_signed(self.options.lease_ttl)
            .ok_or_else(|| {
                SyncError::InvalidOptions(format!(
                    "lease_ttl of {}s overflows the clock",
                    self.options.lease_ttl.num_seconds()
                ))
            })?;

        let acquired = self
            .store
            .try_acquire_lease(job, &holder, started_at, expires_at)
            .await?;
        if !acquired {
            return Err(SyncError::AlreadyRunning {
                job: job.to_string(),
            });
        }

        let result = self.run_leased(started_at).await;

        if let Err(e) = self.store.release_lease(job, &holder).await {
            warn!(job, error = %e, "failed to release sync lease");
        }

        match &result {
            Ok(report) => info!(
                job,
                pages = report.pages,
                fetched = report.fetched,
                created = report.created,
                updated = report.updated,
                skipped = report.skipped,
                malformed = report.malformed,
                failed = report.failed.len(),
                "sync finished"
            ),
            Err(e) => warn!(job, error = %e, "sync failed"),
        }

        result
    }

    async fn run_leased(&self, started_at: DateTime<Utc>) -> Result<SyncReport, SyncError> {
        let job = self.options.job.as_str();

        let mut checkpoint = self
            .store
            .get_checkpoint(job)
            .await?
            .unwrap_or_else(|| SyncCheckpoint::new(job));
        let latest = self.store.latest_updated_at().await?;
        let watermark = compute_watermark(
            latest,
            checkpoint.retry_floor,
            started_at,
            self.options.watermark_margin,
        );
        let start_floor = watermark.unwrap_or_else(full_sync_floor);

        checkpoint.retry_floor = Some(start_floor);
        checkpoint.last_started_at = Some(started_at);
        checkpoint.last_outcome = Some(OUTCOME_RUNNING.to_string());
        self.store.set_checkpoint(&checkpoint).await?;

        info!(job, watermark = ?watermark, "sync started");

        let mut report = SyncReport::new(job, watermark);
        let outcome = match tokio::time::timeout(
            self.options.run_timeout,
            self.process_pages(watermark, &mut report),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::DeadlineExceeded {
                timeout_secs: self.options.run_timeout.as_secs(),
            }),
        };

        let oldest_failure = report.oldest_failure();
        match &outcome {
            Ok(()) => {
                checkpoint.retry_floor = oldest_failure;
                checkpoint.last_outcome = Some(OUTCOME_DONE.to_string());
            }
            Err(_) => {
                checkpoint.retry_floor = Some(match oldest_failure {
                    Some(oldest) => oldest.min(start_floor),
                    None => start_floor,
                });
                checkpoint.last_outcome = Some(OUTCOME_FAILED.to_string());
            }
        }
        checkpoint.last_finished_at = Some(Utc::now());

        match (outcome, self.store.set_checkpoint(&checkpoint).await) {
            (Ok(()), Ok(())) => Ok(report),
            (Ok(()), Err(e)) => Err(SyncError::Store(e)),
            (Err(run_err), Ok(())) => Err(run_err),
            (Err(run_err), Err(e)) => {
                warn!(job, error = %e, "failed to record failed sync in checkpoint");
                Err(run_err)
            }
        }
    }

    async fn process_pages(
        &self,
        watermark: Option<DateTime<Utc>>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let reconciler = Reconciler::new(self.store.as_ref());
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .source
                .fetch_page(cursor.as_deref(), watermark, self.options.page_size)
                .await?;

            report.pages += 1;
            report.fetched += page.servers.len() as u64;
            info!(
                page = report.pages,
                records = page.servers.len(),
                has_next = page.next_cursor.is_some(),
                "fetched page"
            );

            for raw in &page.servers {
                self.apply_record(&reconciler, raw, report).await;
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    async fn apply_record(&self, reconciler: &Reconciler<'_>, raw: &Value, report: &mut SyncReport) {
        let mapped = match map_server(raw) {
            Ok(MapOutcome::Mapped(mapped)) => mapped,
            Ok(MapOutcome::Skip { name }) => {
                debug!(server = %name, "no packages or remotes, skipping");
                report.skipped += 1;
                return;
            }
            Err(e) => {
                warn!(
                    server = record_name(raw).unwrap_or("<unknown>"),
                    error = %error_chain(&e),
                    "malformed upstream record"
                );
                report.malformed += 1;
                return;
            }
        };

        match reconciler.upsert_server(&mapped).await {
            Ok(done) => match done.outcome {
                UpsertOutcome::Created => report.created += 1,
                UpsertOutcome::Updated => report.updated += 1,
            },
            Err(e) => {
                let error = error_chain(&e);
                warn!(
                    server = %mapped.name,
                    version = %mapped.version,
                    error = %error,
                    "failed to reconcile server"
                );
                report.failed.push(RecordFailure {
                    name: mapped.name.clone(),
                    version: mapped.version.clone(),
                    updated_at: mapped.updated_at,
                    error,
                });
            }
        }
    }
}

fn record_name(raw: &Value) -> Option<&str> {
    raw.pointer("/server/name").and_then(Value::as_str)
}

/// `error: source: source ...` on one line.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Open the configured database and run one sync pass against the
/// configured upstream.
pub async fn run_sync(config: &Config) -> anyhow::Result<SyncReport> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::migrate_pool(&pool).await?;

    let store: Arc<dyn RegistryStore> = Arc::new(SqliteStore::new(pool.clone()));
    let source: Arc<dyn CatalogSource> = Arc::new(HttpCatalogClient::new(&config.upstream)?);
    let engine = SyncEngine::new(store, source, SyncOptions::from_config(config));

    let result = engine.run().await;
    pool.close().await;
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn empty_store_means_full_sync() {
        let margin = chrono::Duration::seconds(1);
        assert_eq!(compute_watermark(None, None, at(10), margin), None);
        assert_eq!(
            compute_watermark(None, Some(full_sync_floor()), at(10), margin),
            None
        );
        assert_eq!(
            compute_watermark(Some(at(3)), Some(full_sync_floor()), at(10), margin),
            None
        );
    }

    #[test]
    fn watermark_is_latest_minus_margin() {
        let margin = chrono::Duration::seconds(1);
        assert_eq!(
            compute_watermark(Some(at(3)), None, at(10), margin),
            Some(at(3) - margin)
        );
    }

    #[test]
    fn floor_pulls_watermark_back() {
        let margin = chrono::Duration::seconds(1);
        assert_eq!(
            compute_watermark(Some(at(5)), Some(at(2)), at(10), margin),
            Some(at(2) - margin)
        );
        // A floor above the latest record does not raise the watermark.
        assert_eq!(
            compute_watermark(Some(at(5)), Some(at(7)), at(10), margin),
            Some(at(5) - margin)
        );
    }

    #[test]
    fn watermark_never_exceeds_run_start() {
        let margin = chrono::Duration::zero();
        assert_eq!(
            compute_watermark(Some(at(20)), None, at(10), margin),
            Some(at(10))
        );
    }

    #[test]
    fn oversized_margin_falls_back_to_full_sync() {
        assert_eq!(
            compute_watermark(Some(at(3)), None, at(10), chrono::Duration::MAX),
            None
        );
    }

    #[test]
    fn options_from_unvalidated_config_are_clamped() {
        let sync = SyncConfig {
            watermark_margin_secs: u64::MAX,
            lease_ttl_secs: u64::MAX,
            ..SyncConfig::default()
        };
        let options = SyncOptions::new(&sync, 10);
        assert_eq!(options.lease_ttl, chrono::Duration::seconds(MAX_DURATION_SECS as i64));
        assert_eq!(options.watermark_margin, options.lease_ttl);
    }

    #[tokio::test]
    async fn lease_ttl_past_the_clock_is_an_error() {
        use crate::client::ServerPage;
        use crate::error::FetchError;
        use registry_mirror_core::store::memory::InMemoryStore;

        struct EmptySource;

        #[async_trait::async_trait]
        impl CatalogSource for EmptySource {
            async fn fetch_page(
                &self,
                _cursor: Option<&str>,
                _updated_since: Option<DateTime<Utc>>,
                _limit: u32,
            ) -> Result<ServerPage, FetchError> {
                Ok(ServerPage::default())
            }
        }

        let options = SyncOptions {
            lease_ttl: chrono::Duration::MAX,
            ..SyncOptions::default()
        };
        let engine = SyncEngine::new(Arc::new(InMemoryStore::new()), Arc::new(EmptySource), options);
        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidOptions(_)));
    }

    #[test]
    fn error_chain_includes_sources() {
        let source = anyhow::anyhow!("disk I/O error");
        let err = registry_mirror_core::UpsertError::new(
            registry_mirror_core::EntityKind::Package,
            "npm:@example/x@1.0.0",
            source,
        );
        assert_eq!(
            error_chain(&err),
            "failed to upsert package npm:@example/x@1.0.0: disk I/O error"
        );
    }
}

//! Garbage collection: mark-and-sweep against the catalog, or
//! reference-counting against blob metadata; trash retention; a
//! pressure-gated scheduler.
//!
//! Mark-and-sweep builds the live-hash set by walking every chunk the
//! catalog collaborator knows about, then trashes anything in the store
//! outside that set and old enough to be safe from a concurrent insert.
//! Reference-counting skips the catalog walk entirely and trusts each
//! blob's own reference set instead.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::catalog::DatasetCatalog;
use crate::error::Result;
use crate::store::{Backend, BlobStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GcMethod {
    #[default]
    MarkAndSweep,
    ReferenceCounting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    pub enabled: bool,
    pub method: GcMethod,
    /// Standard cron expression (`sec min hour dom month dow`, per the
    /// `cron` crate), e.g. `"0 0 2 * * *"` for daily at 02:00.
    pub schedule: String,
    pub min_age: Duration,
    pub trash_retention: Duration,
    pub storage_pressure_threshold: u8,
    pub max_size: Option<u64>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: GcMethod::MarkAndSweep,
            schedule: "0 0 2 * * *".to_string(),
            min_age: Duration::from_secs(24 * 3600),
            trash_retention: Duration::from_secs(7 * 24 * 3600),
            storage_pressure_threshold: 80,
            max_size: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcReport {
    pub scanned: u64,
    pub trashed: u64,
    pub trash_purged: u64,
    pub errors: u64,
    pub dry_run: bool,
}

pub struct GarbageCollector {
    store: Arc<dyn BlobStore>,
    catalog: Option<Arc<dyn DatasetCatalog>>,
    config: GcConfig,
    /// Set by [`Self::with_local_trash`] when the underlying store is (or
    /// wraps) a [`crate::local::LocalBlobStore`], so trash retention can
    /// walk and purge `.trash/` directly. `BlobStore` stays a narrow
    /// capability trait with no downcasting, so this is wired up
    /// explicitly by the caller rather than guessed at here.
    local_trash: Option<Arc<crate::local::LocalBlobStore>>,
}

impl GarbageCollector {
    pub fn new(store: Arc<dyn BlobStore>, catalog: Option<Arc<dyn DatasetCatalog>>, config: GcConfig) -> Self {
        Self {
            store,
            catalog,
            config,
            local_trash: None,
        }
    }

    pub fn with_local_trash(mut self, local: Arc<crate::local::LocalBlobStore>) -> Self {
        self.local_trash = Some(local);
        self
    }

    /// `100 * physical_bytes / max_size` for a sized (local/hot) store;
    /// `0` for an S3 backend, which has no fixed capacity to be under
    /// pressure from.
    pub async fn pressure_percent(&self) -> Result<u8> {
        if self.store.backend() == Backend::S3 {
            return Ok(0);
        }
        let Some(max_size) = self.config.max_size else {
            return Ok(0);
        };
        if max_size == 0 {
            return Ok(100);
        }
        let stats = self.store.stats().await?;
        Ok(((100 * stats.physical_bytes as u128) / max_size as u128).min(100) as u8)
    }

    /// Runs one full collection pass: mark/sweep (or reference-count),
    /// then trash retention cleanup. Individual blob failures are logged
    /// and skipped, never fatal.
    pub async fn run(&self, dry_run: bool) -> Result<GcReport> {
        let mut report = GcReport {
            dry_run,
            ..Default::default()
        };

        match self.config.method {
            GcMethod::MarkAndSweep => self.mark_and_sweep(dry_run, &mut report).await?,
            GcMethod::ReferenceCounting => self.reference_counting(dry_run, &mut report).await?,
        }

        self.purge_trash(dry_run, &mut report).await?;
        Ok(report)
    }

    async fn mark_and_sweep(&self, dry_run: bool, report: &mut GcReport) -> Result<()> {
        let catalog = self
            .catalog
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("mark-and-sweep GC requires a DatasetCatalog"))?;

        let mut live: std::collections::HashSet<String> = std::collections::HashSet::new();
        for chunk in catalog.list_all_chunks().await? {
            live.insert(chunk.hash);
        }

        let now = Utc::now();
        for hash in self.store.list("").await? {
            report.scanned += 1;
            if live.contains(&hash) {
                continue;
            }
            match self.store.get_metadata(&hash).await {
                Ok(meta) => {
                    let age = now - meta.created_at;
                    if age < chrono::Duration::from_std(self.config.min_age).unwrap_or_default() {
                        continue;
                    }
                }
                Err(e) => {
                    log::warn!("gc: could not read metadata for {hash}, skipping: {e}");
                    report.errors += 1;
                    continue;
                }
            }
            if dry_run {
                report.trashed += 1;
                continue;
            }
            match self.store.delete(&hash).await {
                Ok(()) => report.trashed += 1,
                Err(e) => {
                    log::warn!("gc: failed to trash unreferenced blob {hash}: {e}");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    async fn reference_counting(&self, dry_run: bool, report: &mut GcReport) -> Result<()> {
        let now = Utc::now();
        for hash in self.store.list("").await? {
            report.scanned += 1;
            let meta = match self.store.get_metadata(&hash).await {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("gc: could not read metadata for {hash}, skipping: {e}");
                    report.errors += 1;
                    continue;
                }
            };
            if !meta.is_orphaned() {
                continue;
            }
            let age = now - meta.created_at;
            if age < chrono::Duration::from_std(self.config.min_age).unwrap_or_default() {
                continue;
            }
            if dry_run {
                report.trashed += 1;
                continue;
            }
            match self.store.delete(&hash).await {
                Ok(()) => report.trashed += 1,
                Err(e) => {
                    log::warn!("gc: failed to trash orphaned blob {hash}: {e}");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    async fn purge_trash(&self, dry_run: bool, report: &mut GcReport) -> Result<()> {
        let Some(local) = self.store_as_local() else {
            // non-local backends manage their own trash expiry (S3
            // lifecycle rules, typically); nothing for us to sweep here.
            return Ok(());
        };
        let retention = chrono::Duration::from_std(self.config.trash_retention).unwrap_or_default();
        let now = std::time::SystemTime::now();
        for (hash, mtime) in local.list_trash()? {
            let age = now
                .duration_since(mtime)
                .map(|d| chrono::Duration::from_std(d).unwrap_or_default())
                .unwrap_or_default();
            if age < retention {
                continue;
            }
            if dry_run {
                report.trash_purged += 1;
                continue;
            }
            match local.empty_trash_entry(&hash) {
                Ok(()) => report.trash_purged += 1,
                Err(e) => {
                    log::warn!("gc: failed to purge trash entry {hash}: {e}");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    fn store_as_local(&self) -> Option<&crate::local::LocalBlobStore> {
        // `BlobStore` is deliberately a narrow capability trait with no
        // downcasting support; trash-retention purge is the one operation
        // that needs backend-specific filesystem access, so it is wired
        // up by the caller passing a concrete local store in, not by
        // reaching through the trait object here. Hybrid/local callers
        // should construct the collector with `with_local_trash`.
        self.local_trash.as_deref()
    }
}

/// Schedule evaluation for the GC loop: the next due time after `after`,
/// computed with a real 6-field cron evaluator.
pub fn next_run(schedule: &str, after: chrono::DateTime<Utc>) -> Result<chrono::DateTime<Utc>> {
    let schedule = Schedule::from_str(schedule)?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| anyhow::anyhow!("cron schedule '{schedule}' has no future occurrence"))
}

impl GarbageCollector {
    /// Whether a scheduled tick is due at all, independent of pressure.
    fn tick_due(&self, last_run: chrono::DateTime<Utc>, now: chrono::DateTime<Utc>) -> Result<bool> {
        Ok(next_run(&self.config.schedule, last_run)? <= now)
    }

    /// Combines the cron schedule with the pressure trigger: a scheduler
    /// loop calls this once per tick and only invokes [`Self::run`] when it
    /// returns `true`. Per spec.md §4.5, a due tick whose current pressure
    /// is below `storage_pressure_threshold` is skipped entirely rather
    /// than running a no-op pass.
    pub async fn should_run_now(&self, last_run: chrono::DateTime<Utc>, now: chrono::DateTime<Utc>) -> Result<bool> {
        if !self.config.enabled || !self.tick_due(last_run, now)? {
            return Ok(false);
        }
        Ok(self.pressure_percent().await? >= self.config.storage_pressure_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::MemoryCatalog;
    use crate::catalog::{ChunkDescriptor, ChunkStatus};
    use crate::codec::{Compression, Encryption};
    use crate::local::{LocalBlobStore, LocalStoreConfig};
    use crate::metadata::BlobMetadata;

    fn local_store(path: &std::path::Path) -> Arc<LocalBlobStore> {
        Arc::new(
            LocalBlobStore::open(
                LocalStoreConfig {
                    path: path.to_path_buf(),
                    compression_enabled: false,
                    compression_algorithm: Compression::None,
                    compression_level: 3,
                    encryption_enabled: false,
                },
                None,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn mark_and_sweep_collects_unreferenced_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let store = local_store(tmp.path());

        let keep = b"keep me";
        let keep_hash = crate::store::hash_bytes(keep);
        store
            .put(&keep_hash, keep, BlobMetadata::new(keep_hash.clone(), keep.len() as u64, Compression::None, Encryption::None))
            .await
            .unwrap();

        let drop_data = b"drop me";
        let drop_hash = crate::store::hash_bytes(drop_data);
        store
            .put(&drop_hash, drop_data, BlobMetadata::new(drop_hash.clone(), drop_data.len() as u64, Compression::None, Encryption::None))
            .await
            .unwrap();

        let catalog = Arc::new(MemoryCatalog::default());
        catalog
            .record_chunk(
                ChunkDescriptor {
                    dataset_id: "d1".into(),
                    version_id: "v1".into(),
                    index: 0,
                    hash: keep_hash.clone(),
                },
                keep.len() as u64,
                ChunkStatus::Verified,
            )
            .await
            .unwrap();

        let mut config = GcConfig::default();
        config.min_age = Duration::from_secs(0);
        config.trash_retention = Duration::from_secs(0);

        let gc = GarbageCollector::new(store.clone(), Some(catalog.clone()), config).with_local_trash(store.clone());

        let report = gc.run(false).await.unwrap();
        assert_eq!(report.trashed, 1);

        assert!(store.exists(&keep_hash).await.unwrap());
        assert!(!store.exists(&drop_hash).await.unwrap());

        // immediate trash retention of 0 purges it on the next run
        let report2 = gc.run(false).await.unwrap();
        assert_eq!(report2.trash_purged, 1);
        assert!(store.list_trash().unwrap().is_empty());
    }

    #[test]
    fn cron_schedule_produces_a_future_run() {
        let now = Utc::now();
        let next = next_run("0 0 2 * * *", now).unwrap();
        assert!(next > now);
    }

    #[tokio::test]
    async fn should_run_now_is_gated_by_pressure() {
        let tmp = tempfile::tempdir().unwrap();
        let store = local_store(tmp.path());

        // every-second schedule so the tick is always due in this test
        let mut config = GcConfig::default();
        config.schedule = "* * * * * *".to_string();
        config.max_size = Some(1_000_000);
        config.storage_pressure_threshold = 50;

        let gc = GarbageCollector::new(store.clone(), None, config);
        let last_run = Utc::now() - chrono::Duration::seconds(5);
        let now = Utc::now();

        // empty store: 0% pressure, below the 50% threshold
        assert!(!gc.should_run_now(last_run, now).await.unwrap());
    }
}

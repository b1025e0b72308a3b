//! Building index snapshots from the catalog, and keeping the served
//! snapshot and the persisted pair in step.
//!
//! A rebuild runs alongside query serving: readers keep the previous
//! snapshot until the new one is fully built and saved, then it is swapped
//! in. Only one build may run at a time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;

use crate::catalog::{CatalogError, CatalogId, CatalogRecord, CatalogStore};
use crate::fetch::ImageFetcher;
use crate::semantic::deadline::CallGate;
use crate::semantic::embeddings::EmbeddingProvider;
use crate::semantic::normalize::UnitVector;
use crate::semantic::orchestrator::{embed_image_url, SkippedImage};
use crate::semantic::snapshot::{IndexSnapshot, SnapshotError, SnapshotHandle};
use crate::semantic::storage::{IndexStorage, IndexStorageError};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("an index build is already running")]
    AlreadyRunning,

    #[error("none of the {attempted} catalog images could be embedded, keeping the current index")]
    NothingEmbedded { attempted: usize },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("storage error: {0}")]
    Storage(#[from] IndexStorageError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Outcome of one build or append.
#[derive(Debug)]
pub struct BuildReport {
    pub snapshot: IndexSnapshot,
    /// Vectors added by this run.
    pub added: usize,
    pub skipped: Vec<SkippedImage>,
}

/// Serializable summary of a published build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub build_tag: String,
    pub built_at: String,
    pub added: usize,
    pub total: usize,
    pub skipped: Vec<SkippedImage>,
}

/// Turns catalog records into index entries.
pub struct IndexBuilder {
    embedder: Arc<dyn EmbeddingProvider>,
    fetcher: Arc<dyn ImageFetcher>,
    dimensions: usize,
    embed_timeout: Duration,
    pool: rayon::ThreadPool,
    embed_gate: Arc<CallGate>,
    show_progress: bool,
}

impl IndexBuilder {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        fetcher: Arc<dyn ImageFetcher>,
        dimensions: usize,
        concurrency: usize,
        embed_timeout: Duration,
    ) -> Result<Self, BuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|i| format!("index-build-{i}"))
            .build()
            .map_err(|e| BuildError::Internal(format!("failed to build pool: {e}")))?;

        Ok(Self {
            embedder,
            fetcher,
            dimensions,
            embed_timeout,
            pool,
            embed_gate: CallGate::new(concurrency),
            show_progress: false,
        })
    }

    /// Draw a progress bar on stderr while embedding.
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Fresh snapshot over `records`. Records whose image cannot be fetched
    /// or embedded are skipped.
    pub fn build(&self, records: &[CatalogRecord]) -> Result<BuildReport, BuildError> {
        let (entries, skipped) = self.embed_records(records);
        let added = entries.len();
        let snapshot = IndexSnapshot::from_entries(self.dimensions, entries)?;

        Ok(BuildReport {
            snapshot,
            added,
            skipped,
        })
    }

    /// Copy of `base` with `records` appended. `base` is not modified.
    pub fn append(&self, base: &IndexSnapshot, records: &[CatalogRecord]) -> Result<BuildReport, BuildError> {
        let (entries, skipped) = self.embed_records(records);
        let added = entries.len();
        let snapshot = base.appended(entries)?;

        Ok(BuildReport {
            snapshot,
            added,
            skipped,
        })
    }

    /// Embed every record's image, preserving catalog order in the output.
    fn embed_records(
        &self,
        records: &[CatalogRecord],
    ) -> (Vec<(CatalogId, UnitVector)>, Vec<SkippedImage>) {
        let progress = if self.show_progress {
            let bar = ProgressBar::new(records.len() as u64);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}",
            ) {
                bar.set_style(style);
            }
            bar
        } else {
            ProgressBar::hidden()
        };

        let outcomes: Vec<_> = self.pool.install(|| {
            records
                .par_iter()
                .map(|record| {
                    let outcome = embed_image_url(
                        self.fetcher.as_ref(),
                        &self.embedder,
                        &self.embed_gate,
                        &record.image_url,
                        self.embed_timeout,
                    );
                    progress.inc(1);
                    (record, outcome)
                })
                .collect()
        });
        progress.finish_and_clear();

        let mut entries = Vec::with_capacity(outcomes.len());
        let mut skipped = Vec::new();
        for (record, outcome) in outcomes {
            match outcome {
                Ok(vector) if vector.dimensions() == self.dimensions => {
                    entries.push((record.id.clone(), vector));
                }
                Ok(vector) => {
                    log::warn!(
                        "skipping {}: embedding has {} dimensions, index expects {}",
                        record.id,
                        vector.dimensions(),
                        self.dimensions
                    );
                    skipped.push(SkippedImage {
                        url: record.image_url.clone(),
                        reason: format!("wrong dimensions ({})", vector.dimensions()),
                    });
                }
                Err(err) => {
                    log::warn!("skipping {} ({}): {err}", record.id, record.image_url);
                    skipped.push(SkippedImage {
                        url: record.image_url.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        log::info!("embedded {} of {} catalog images", entries.len(), records.len());
        (entries, skipped)
    }
}

/// Owns the lifecycle of the served snapshot: load at start, rebuild,
/// append, persist, publish.
pub struct IndexManager {
    builder: IndexBuilder,
    storage: IndexStorage,
    catalog: Arc<dyn CatalogStore>,
    snapshots: Arc<SnapshotHandle>,
    model_name: String,
    building: AtomicBool,
    last_build: RwLock<Option<BuildSummary>>,
}

/// Clears the build flag when the build ends, however it ends.
struct BuildGuard<'a>(&'a AtomicBool);

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl IndexManager {
    pub fn new(
        builder: IndexBuilder,
        storage: IndexStorage,
        catalog: Arc<dyn CatalogStore>,
        snapshots: Arc<SnapshotHandle>,
        model_name: &str,
    ) -> Self {
        Self {
            builder,
            storage,
            catalog,
            snapshots,
            model_name: model_name.to_string(),
            building: AtomicBool::new(false),
            last_build: RwLock::new(None),
        }
    }

    pub fn snapshots(&self) -> &Arc<SnapshotHandle> {
        &self.snapshots
    }

    pub fn is_building(&self) -> bool {
        self.building.load(Ordering::Acquire)
    }

    /// Summary of the most recent successful build or append in this process.
    pub fn last_build(&self) -> Option<BuildSummary> {
        match self.last_build.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Load the persisted pair and publish it.
    ///
    /// Returns `Ok(false)` when nothing has been built yet. A damaged or
    /// mismatched pair is an error and nothing is published.
    pub fn load_persisted(&self) -> Result<bool, IndexStorageError> {
        if !self.storage.exists() {
            log::warn!(
                "no index at {}, run `vibe build-index` first",
                self.storage.index_path().display()
            );
            return Ok(false);
        }

        let snapshot = self
            .storage
            .load(&self.model_name, self.builder.dimensions())
            .inspect_err(|e| log::error!("refusing to serve persisted index: {e}"))?;

        log::info!(
            "loaded index build {} with {} vectors",
            snapshot.build_tag,
            snapshot.len()
        );
        self.snapshots.publish(snapshot);
        Ok(true)
    }

    /// Rebuild from the full catalog, persist, then swap it in.
    pub fn rebuild(&self) -> Result<BuildSummary, BuildError> {
        self.claim()?;
        let _guard = BuildGuard(&self.building);
        self.rebuild_claimed()
    }

    /// Start a rebuild on a background thread and return immediately.
    ///
    /// Fails with [`BuildError::AlreadyRunning`] without spawning anything if
    /// a build is in progress. The outcome is logged and, on success,
    /// available from [`Self::last_build`].
    pub fn spawn_rebuild(self: &Arc<Self>) -> Result<(), BuildError> {
        self.claim()?;

        let manager = self.clone();
        std::thread::Builder::new()
            .name("index-rebuild".to_string())
            .spawn(move || {
                let _guard = BuildGuard(&manager.building);
                if let Err(err) = manager.rebuild_claimed() {
                    log::error!("index rebuild failed: {err}");
                }
            })
            .map_err(|e| {
                self.building.store(false, Ordering::Release);
                BuildError::Internal(format!("failed to spawn rebuild thread: {e}"))
            })?;

        Ok(())
    }

    fn rebuild_claimed(&self) -> Result<BuildSummary, BuildError> {
        self.catalog.refresh()?;
        let records = self.catalog.all()?;
        log::info!("rebuilding index from {} catalog records", records.len());

        let report = self.builder.build(&records)?;
        if report.added == 0 && !records.is_empty() {
            return Err(BuildError::NothingEmbedded {
                attempted: records.len(),
            });
        }
        self.persist_and_publish(report)
    }

    /// Embed catalog records the served snapshot does not know yet and
    /// publish the extended snapshot. Changed records are not picked up;
    /// those need a full rebuild.
    pub fn append_new(&self) -> Result<BuildSummary, BuildError> {
        self.claim()?;
        let _guard = BuildGuard(&self.building);

        self.catalog.refresh()?;
        let base = match self.snapshots.current() {
            Some(current) => current,
            None => Arc::new(IndexSnapshot::empty(self.builder.dimensions())),
        };

        let known: HashSet<&CatalogId> = base.id_map.ids().iter().collect();
        let fresh: Vec<CatalogRecord> = self
            .catalog
            .all()?
            .into_iter()
            .filter(|record| !known.contains(&record.id))
            .collect();
        log::info!("appending {} new catalog records", fresh.len());

        let report = self.builder.append(&base, &fresh)?;
        self.persist_and_publish(report)
    }

    fn claim(&self) -> Result<(), BuildError> {
        self.building
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| BuildError::AlreadyRunning)
    }

    fn persist_and_publish(&self, report: BuildReport) -> Result<BuildSummary, BuildError> {
        self.storage.save(&report.snapshot, &self.model_name)?;

        let summary = BuildSummary {
            build_tag: report.snapshot.build_tag.to_string(),
            built_at: report.snapshot.build_tag.built_at().to_rfc3339(),
            added: report.added,
            total: report.snapshot.len(),
            skipped: report.skipped,
        };

        self.snapshots.publish(report.snapshot);
        log::info!(
            "published index build {} ({} vectors, {} skipped)",
            summary.build_tag,
            summary.total,
            summary.skipped.len()
        );

        match self.last_build.write() {
            Ok(mut guard) => *guard = Some(summary.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(summary.clone()),
        }
        Ok(summary)
    }
}

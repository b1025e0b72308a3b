//! Query orchestration: intent -> query vector -> ranked catalog records.
//!
//! Per request:
//! 1. Embed the intent (one image, one text, or a board of images).
//! 2. Search the snapshot currently being served.
//! 3. Resolve ordinals to catalog ids, keeping the best score per id.
//! 4. Fetch the records from the catalog store.
//! 5. Attach scores and rank.
//!
//! The orchestrator holds no per-request state, so one instance serves any
//! number of concurrent requests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use serde::Serialize;

use crate::catalog::{CatalogError, CatalogId, CatalogRecord, CatalogStore};
use crate::config::Config;
use crate::fetch::{FetchError, ImageFetcher};
use crate::semantic::deadline::{run_gated, run_with_deadline, CallGate, DeadlineError};
use crate::semantic::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::semantic::id_map::UnknownOrdinalError;
use crate::semantic::index::{score_order, IndexError};
use crate::semantic::normalize::{mean_direction, normalize, DegenerateVectorError, UnitVector};
use crate::semantic::snapshot::SnapshotHandle;

/// Errors that can occur while answering a query.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("no similarity index is loaded")]
    IndexNotLoaded,

    #[error("query text is empty")]
    EmptyQuery,

    #[error("none of the {attempted} images could be embedded")]
    NoEmbeddableInput { attempted: usize },

    #[error("no usable embedding: {0}")]
    Degenerate(#[from] DegenerateVectorError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("index integrity error: {0}")]
    Integrity(#[from] UnknownOrdinalError),

    #[error("image fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad or unembeddable input; the caller can change the request.
    Input,
    /// Index/map state is corrupt; nothing should be served.
    Integrity,
    /// An external collaborator failed or timed out.
    Upstream,
    /// Nothing to search yet.
    Unavailable,
}

impl SearchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SearchError::EmptyQuery
            | SearchError::NoEmbeddableInput { .. }
            | SearchError::Degenerate(_)
            | SearchError::Index(IndexError::ZeroK) => ErrorClass::Input,
            SearchError::Fetch(FetchError::InvalidUrl(_))
            | SearchError::Fetch(FetchError::NotAnImage)
            | SearchError::Fetch(FetchError::TooLarge(_)) => ErrorClass::Input,
            SearchError::Index(IndexError::Empty) | SearchError::IndexNotLoaded => {
                ErrorClass::Unavailable
            }
            SearchError::Index(_) | SearchError::Integrity(_) | SearchError::Internal(_) => {
                ErrorClass::Integrity
            }
            SearchError::Fetch(_) | SearchError::Embedding(_) | SearchError::Catalog(_) => {
                ErrorClass::Upstream
            }
        }
    }
}

/// What the caller is looking for.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryIntent {
    Image(String),
    Text(String),
    Board(Vec<String>),
}

/// A catalog record with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    #[serde(flatten)]
    pub record: CatalogRecord,
    pub score: f32,
}

/// A board image that did not contribute to the vibe vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedImage {
    pub url: String,
    pub reason: String,
}

/// The aggregated board vector plus what went into it.
#[derive(Debug, Clone)]
pub struct VibeVector {
    pub vector: UnitVector,
    pub attempted: usize,
    pub embedded: usize,
    pub skipped: Vec<SkippedImage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardResults {
    pub attempted: usize,
    pub embedded: usize,
    pub skipped: Vec<SkippedImage>,
    pub results: Vec<RankedResult>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub single_top_k: usize,
    pub board_top_k: usize,
    pub board_max_images: usize,
    pub board_concurrency: usize,
    pub embed_timeout: Duration,
    pub catalog_timeout: Duration,
    pub catalog_retries: u8,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            single_top_k: config.search.single_top_k,
            board_top_k: config.search.board_top_k,
            board_max_images: config.search.board_max_images,
            board_concurrency: config.search.board_concurrency,
            embed_timeout: Duration::from_secs(config.embedding.embed_timeout_secs),
            catalog_timeout: Duration::from_secs(config.catalog.fetch_timeout_secs),
            catalog_retries: config.fetch.max_retries,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct QueryOrchestrator {
    embedder: Arc<dyn EmbeddingProvider>,
    fetcher: Arc<dyn ImageFetcher>,
    catalog: Arc<dyn CatalogStore>,
    snapshots: Arc<SnapshotHandle>,
    settings: OrchestratorSettings,
    /// Bounds board fan-out.
    pool: rayon::ThreadPool,
    /// Bounds embed calls still running, timed out or not.
    embed_gate: Arc<CallGate>,
}

impl QueryOrchestrator {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        fetcher: Arc<dyn ImageFetcher>,
        catalog: Arc<dyn CatalogStore>,
        snapshots: Arc<SnapshotHandle>,
        settings: OrchestratorSettings,
    ) -> Result<Self, SearchError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.board_concurrency.max(1))
            .thread_name(|i| format!("board-embed-{i}"))
            .build()
            .map_err(|e| SearchError::Internal(format!("failed to build board pool: {e}")))?;

        Ok(Self {
            embedder,
            fetcher,
            catalog,
            snapshots,
            embed_gate: CallGate::new(settings.board_concurrency),
            settings,
            pool,
        })
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn snapshots(&self) -> &Arc<SnapshotHandle> {
        &self.snapshots
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    /// Dispatch any intent with its default k. Board outcomes are reduced to
    /// their results; use [`Self::search_by_board`] for the partial-failure report.
    pub fn search(&self, intent: QueryIntent) -> Result<Vec<RankedResult>, SearchError> {
        match intent {
            QueryIntent::Image(url) => self.search_by_image(&url, None),
            QueryIntent::Text(text) => self.search_by_text(&text, None),
            QueryIntent::Board(urls) => self.search_by_board(&urls, None).map(|b| b.results),
        }
    }

    pub fn search_by_image(&self, url: &str, k: Option<usize>) -> Result<Vec<RankedResult>, SearchError> {
        log::info!("visual search for {url}");
        let vector = embed_image_url(
            self.fetcher.as_ref(),
            &self.embedder,
            &self.embed_gate,
            url,
            self.settings.embed_timeout,
        )?;
        self.rank(&vector, k.unwrap_or(self.settings.single_top_k))
    }

    pub fn search_by_text(&self, text: &str, k: Option<usize>) -> Result<Vec<RankedResult>, SearchError> {
        log::info!("text search for '{text}'");
        let vector = self.embed_text(text)?;
        self.rank(&vector, k.unwrap_or(self.settings.single_top_k))
    }

    pub fn search_by_board(&self, urls: &[String], k: Option<usize>) -> Result<BoardResults, SearchError> {
        let vibe = self.vibe_vector(urls)?;
        let results = self.rank(&vibe.vector, k.unwrap_or(self.settings.board_top_k))?;

        Ok(BoardResults {
            attempted: vibe.attempted,
            embedded: vibe.embedded,
            skipped: vibe.skipped,
            results,
        })
    }

    pub fn embed_text(&self, text: &str) -> Result<UnitVector, SearchError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SearchError::EmptyQuery);
        }

        let embedder = self.embedder.clone();
        let owned = text.to_string();
        let raw = run_gated(&self.embed_gate, self.settings.embed_timeout, move || {
            embedder.embed_text(&owned)
        })
        .map_err(embed_deadline_error)??;

        Ok(normalize(&raw)?)
    }

    /// Aggregate a board into one vector.
    ///
    /// Images are fetched and embedded independently with bounded
    /// concurrency. Failures are logged and skipped; the request only fails
    /// when none succeed.
    pub fn vibe_vector(&self, urls: &[String]) -> Result<VibeVector, SearchError> {
        let urls = &urls[..urls.len().min(self.settings.board_max_images)];
        if urls.len() < self.settings.board_max_images {
            log::info!("analysing {} board images", urls.len());
        } else {
            log::info!("analysing first {} board images", urls.len());
        }

        let outcomes: Vec<(&String, Result<UnitVector, SearchError>)> = self.pool.install(|| {
            urls.par_iter()
                .map(|url| {
                    let outcome = embed_image_url(
                        self.fetcher.as_ref(),
                        &self.embedder,
                        &self.embed_gate,
                        url,
                        self.settings.embed_timeout,
                    );
                    (url, outcome)
                })
                .collect()
        });

        let mut vectors = Vec::with_capacity(outcomes.len());
        let mut skipped = Vec::new();
        for (url, outcome) in outcomes {
            match outcome {
                Ok(vector) => vectors.push(vector),
                Err(err) => {
                    log::warn!("skipping board image {url}: {err}");
                    skipped.push(SkippedImage {
                        url: url.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if vectors.is_empty() {
            return Err(SearchError::NoEmbeddableInput {
                attempted: urls.len(),
            });
        }

        let vector = mean_direction(&vectors)?;

        Ok(VibeVector {
            vector,
            attempted: urls.len(),
            embedded: vectors.len(),
            skipped,
        })
    }

    /// Steps 2-5: search, resolve, fetch, fuse.
    pub fn rank(&self, query: &UnitVector, k: usize) -> Result<Vec<RankedResult>, SearchError> {
        let snapshot = self.snapshots.current().ok_or(SearchError::IndexNotLoaded)?;
        let hits = snapshot.search(query, k)?;

        // id -> (best score, position of first hit)
        let mut best: HashMap<CatalogId, (f32, usize)> = HashMap::with_capacity(hits.len());
        for (position, hit) in hits.iter().enumerate() {
            let id = snapshot.resolve(hit)?;
            best.entry(id.clone())
                .and_modify(|(score, _)| *score = score.max(hit.score))
                .or_insert((hit.score, position));
        }

        if best.is_empty() {
            return Ok(vec![]);
        }

        let ids: HashSet<CatalogId> = best.keys().cloned().collect();
        let records = self.fetch_records(ids)?;

        let mut ranked: Vec<(usize, RankedResult)> = records
            .into_iter()
            .filter_map(|record| {
                let &(score, position) = best.get(&record.id)?;
                Some((position, RankedResult { record, score }))
            })
            .collect();

        let dropped = best.len().saturating_sub(ranked.len());
        if dropped > 0 {
            log::debug!("{dropped} indexed ids are no longer in the catalog");
        }

        ranked.sort_by(|(pa, a), (pb, b)| {
            score_order(a.score, b.score).then_with(|| pa.cmp(pb))
        });
        Ok(ranked.into_iter().map(|(_, result)| result).collect())
    }

    /// Bulk fetch with a timeout per attempt; retried because the read is idempotent.
    fn fetch_records(&self, ids: HashSet<CatalogId>) -> Result<Vec<CatalogRecord>, SearchError> {
        let timeout = self.settings.catalog_timeout;
        let mut attempt = 0u8;

        loop {
            let catalog = self.catalog.clone();
            let request = ids.clone();
            let result = match run_with_deadline(timeout, move || catalog.fetch_by_ids(&request)) {
                Ok(result) => result,
                Err(DeadlineError::Elapsed(t)) => Err(CatalogError::Timeout(t.as_millis())),
                Err(DeadlineError::Panicked) => {
                    Err(CatalogError::Unavailable("catalog worker panicked".to_string()))
                }
            };

            match result {
                Err(err) if attempt < self.settings.catalog_retries && is_transient_catalog(&err) => {
                    attempt += 1;
                    log::info!(
                        "retrying catalog fetch (attempt {attempt}/{}) after error: {err}",
                        self.settings.catalog_retries
                    );
                }
                result => return Ok(result?),
            }
        }
    }
}

fn is_transient_catalog(err: &CatalogError) -> bool {
    matches!(err, CatalogError::Timeout(_) | CatalogError::Unavailable(_))
}

fn embed_deadline_error(err: DeadlineError) -> SearchError {
    match err {
        DeadlineError::Elapsed(t) => EmbeddingError::Timeout(t.as_millis()).into(),
        DeadlineError::Panicked => {
            EmbeddingError::EmbeddingFailed("embedding worker panicked".to_string()).into()
        }
    }
}

/// Fetch one image and embed it under `timeout`, returning a unit vector.
/// The embed call holds a slot of `gate` until it returns.
pub(crate) fn embed_image_url(
    fetcher: &dyn ImageFetcher,
    embedder: &Arc<dyn EmbeddingProvider>,
    gate: &Arc<CallGate>,
    url: &str,
    timeout: Duration,
) -> Result<UnitVector, SearchError> {
    let bytes = fetcher.fetch(url)?;

    let embedder = embedder.clone();
    let raw = run_gated(gate, timeout, move || embedder.embed_image(&bytes))
        .map_err(embed_deadline_error)??;

    Ok(normalize(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(SearchError::EmptyQuery.class(), ErrorClass::Input);
        assert_eq!(
            SearchError::NoEmbeddableInput { attempted: 3 }.class(),
            ErrorClass::Input
        );
        assert_eq!(SearchError::Index(IndexError::Empty).class(), ErrorClass::Unavailable);
        assert_eq!(
            SearchError::Integrity(UnknownOrdinalError { ordinal: 4, len: 2 }).class(),
            ErrorClass::Integrity
        );
        assert_eq!(SearchError::Fetch(FetchError::Timeout).class(), ErrorClass::Upstream);
        assert_eq!(
            SearchError::Fetch(FetchError::InvalidUrl("x".into())).class(),
            ErrorClass::Input
        );
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = Config::default();
        config.search.board_top_k = 25;
        config.embedding.embed_timeout_secs = 7;

        let settings = OrchestratorSettings::from_config(&config);
        assert_eq!(settings.board_top_k, 25);
        assert_eq!(settings.single_top_k, 10);
        assert_eq!(settings.embed_timeout, Duration::from_secs(7));
    }
}

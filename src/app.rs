//! Wiring: one explicit service handle owning every long-lived component.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use homedir::my_home;

use crate::catalog::{CatalogStore, CsvCatalog};
use crate::config::Config;
use crate::fetch::{HttpImageFetcher, ImageFetcher};
use crate::semantic::{
    ClipEmbedder, EmbeddingProvider, IndexBuilder, IndexManager, IndexStorage, OrchestratorSettings,
    QueryOrchestrator, SnapshotHandle,
};

/// Resolve the data directory: `VIBE_BASE_PATH`, else `~/.local/share/vibe`.
pub fn base_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("VIBE_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/vibe"))
}

/// The running service: query orchestrator and index manager over one
/// shared snapshot handle. Cloning is cheap.
#[derive(Clone)]
pub struct App {
    config: Arc<Config>,
    orchestrator: Arc<QueryOrchestrator>,
    manager: Arc<IndexManager>,
}

impl App {
    /// Production wiring: CLIP embedder, HTTP fetcher, CSV catalog.
    pub fn new(config: Config, show_progress: bool) -> Result<Self> {
        let catalog_path = config.catalog_path();
        let catalog = CsvCatalog::open(&catalog_path)
            .with_context(|| format!("failed to open catalog {}", catalog_path.display()))?;

        let fetcher = HttpImageFetcher::new(&config.fetch).context("failed to build http client")?;

        let embedder = ClipEmbedder::new(&config.embedding.model, config.base_path().to_path_buf())
            .context("failed to load embedding model")?;

        Self::with_components(
            config,
            Arc::new(embedder),
            Arc::new(fetcher),
            Arc::new(catalog),
            show_progress,
        )
    }

    /// Wire the service around the given collaborators.
    pub fn with_components(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        fetcher: Arc<dyn ImageFetcher>,
        catalog: Arc<dyn CatalogStore>,
        show_progress: bool,
    ) -> Result<Self> {
        if embedder.dimensions() != config.embedding.dimensions {
            bail!(
                "model '{}' produces {} dimensions but embedding.dimensions is {}",
                embedder.model_name(),
                embedder.dimensions(),
                config.embedding.dimensions
            );
        }

        let snapshots = Arc::new(SnapshotHandle::new());
        let settings = OrchestratorSettings::from_config(&config);

        let builder = IndexBuilder::new(
            embedder.clone(),
            fetcher.clone(),
            config.embedding.dimensions,
            config.search.board_concurrency,
            Duration::from_secs(config.embedding.embed_timeout_secs),
        )?
        .with_progress(show_progress);

        let storage = IndexStorage::new(config.index_path(), config.ids_path());
        let manager = IndexManager::new(
            builder,
            storage,
            catalog.clone(),
            snapshots.clone(),
            embedder.model_name(),
        );

        let orchestrator = QueryOrchestrator::new(embedder, fetcher, catalog, snapshots, settings)?;

        Ok(Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
            manager: Arc::new(manager),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<QueryOrchestrator> {
        &self.orchestrator
    }

    pub fn manager(&self) -> &Arc<IndexManager> {
        &self.manager
    }
}

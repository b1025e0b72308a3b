use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.yaml";

/// CLIP ViT-B/32, shared image/text space
const DEFAULT_MODEL: &str = "clip-vit-b-32";
const DEFAULT_DIMENSIONS: usize = 512;
const DEFAULT_EMBED_TIMEOUT_SECS: u64 = 30;

const DEFAULT_SINGLE_TOP_K: usize = 10;
/// Board queries cast a wider net than single-item queries
const DEFAULT_BOARD_TOP_K: usize = 20;
const DEFAULT_BOARD_MAX_IMAGES: usize = 15;
const DEFAULT_BOARD_CONCURRENCY: usize = 4;

const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FETCH_MAX_RETRIES: u8 = 2;
const DEFAULT_MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.114 Safari/537.36";

const DEFAULT_CATALOG_FETCH_TIMEOUT_SECS: u64 = 5;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name for embeddings (e.g., "clip-vit-b-32")
    #[serde(default = "default_model")]
    pub model: String,

    /// Dimensions every stored and query vector must have
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Timeout for a single embed call in seconds
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            dimensions: DEFAULT_DIMENSIONS,
            embed_timeout_secs: DEFAULT_EMBED_TIMEOUT_SECS,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_embed_timeout_secs() -> u64 {
    DEFAULT_EMBED_TIMEOUT_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,

    #[serde(default = "default_ids_file")]
    pub ids_file: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
            ids_file: default_ids_file(),
        }
    }
}

fn default_index_file() -> String {
    "style.index".to_string()
}

fn default_ids_file() -> String {
    "ids.json".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Results for single-image and text queries
    #[serde(default = "default_single_top_k")]
    pub single_top_k: usize,

    /// Results for board (multi-image) queries
    #[serde(default = "default_board_top_k")]
    pub board_top_k: usize,

    /// Board images beyond this count are ignored
    #[serde(default = "default_board_max_images")]
    pub board_max_images: usize,

    /// Board images fetched and embedded at the same time
    #[serde(default = "default_board_concurrency")]
    pub board_concurrency: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            single_top_k: DEFAULT_SINGLE_TOP_K,
            board_top_k: DEFAULT_BOARD_TOP_K,
            board_max_images: DEFAULT_BOARD_MAX_IMAGES,
            board_concurrency: DEFAULT_BOARD_CONCURRENCY,
        }
    }
}

fn default_single_top_k() -> usize {
    DEFAULT_SINGLE_TOP_K
}

fn default_board_top_k() -> usize {
    DEFAULT_BOARD_TOP_K
}

fn default_board_max_images() -> usize {
    DEFAULT_BOARD_MAX_IMAGES
}

fn default_board_concurrency() -> usize {
    DEFAULT_BOARD_CONCURRENCY
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries for transient failures (timeouts, 5xx, 429)
    #[serde(default = "default_fetch_max_retries")]
    pub max_retries: u8,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            max_retries: DEFAULT_FETCH_MAX_RETRIES,
            user_agent: default_user_agent(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_fetch_max_retries() -> u8 {
    DEFAULT_FETCH_MAX_RETRIES
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_max_image_bytes() -> u64 {
    DEFAULT_MAX_IMAGE_BYTES
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// CSV file, relative to the base path unless absolute
    #[serde(default = "default_catalog_path")]
    pub path: String,

    #[serde(default = "default_catalog_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
            fetch_timeout_secs: DEFAULT_CATALOG_FETCH_TIMEOUT_SECS,
        }
    }
}

fn default_catalog_path() -> String {
    "catalog.csv".to_string()
}

fn default_catalog_fetch_timeout_secs() -> u64 {
    DEFAULT_CATALOG_FETCH_TIMEOUT_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.embedding.dimensions == 0 || self.embedding.dimensions > u16::MAX as usize {
            bail!(
                "embedding.dimensions must be between 1 and {}, got {}",
                u16::MAX,
                self.embedding.dimensions
            );
        }

        if self.embedding.embed_timeout_secs == 0 {
            bail!("embedding.embed_timeout_secs must be greater than 0");
        }

        let search = &self.search;
        if search.single_top_k == 0 || search.board_top_k == 0 {
            bail!("search.single_top_k and search.board_top_k must be greater than 0");
        }

        if search.board_max_images == 0 {
            bail!("search.board_max_images must be greater than 0");
        }

        if search.board_concurrency == 0 || search.board_concurrency > 64 {
            bail!(
                "search.board_concurrency must be between 1 and 64, got {}",
                search.board_concurrency
            );
        }

        if self.fetch.timeout_secs == 0 {
            bail!("fetch.timeout_secs must be greater than 0");
        }

        if self.fetch.max_retries > 5 {
            bail!("fetch.max_retries cannot exceed 5, got {}", self.fetch.max_retries);
        }

        if self.catalog.fetch_timeout_secs == 0 {
            bail!("catalog.fetch_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if absent.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let config_path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !config_path.exists() {
            let mut config = Self::default();
            config.base_path = base_path.to_path_buf();
            config.save()?;
        }

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = self.base_path.join(CONFIG_FILE);
        let temp_path = config_path.with_extension("yaml.tmp");

        std::fs::write(&temp_path, serde_yml::to_string(&self)?)?;
        std::fs::rename(&temp_path, &config_path)?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn index_path(&self) -> PathBuf {
        self.base_path.join(&self.index.index_file)
    }

    pub fn ids_path(&self) -> PathBuf {
        self.base_path.join(&self.index.ids_file)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.base_path.join(&self.catalog.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.embedding.dimensions, 512);
        assert_eq!(config.search.single_top_k, 10);
        assert_eq!(config.search.board_top_k, 20);
        assert_eq!(config.search.board_max_images, 15);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: Config = serde_yml::from_str("search:\n  board_top_k: 30\n").unwrap();
        assert_eq!(config.search.board_top_k, 30);
        assert_eq!(config.search.single_top_k, 10);
        assert_eq!(config.embedding.model, "clip-vit-b-32");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.search.board_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_creates_file() {
        let dir = tempfile::tempdir().unwrap();

        let config = Config::load_with(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE).exists());
        assert_eq!(config.index_path(), dir.path().join("style.index"));
        assert_eq!(config.catalog_path(), dir.path().join("catalog.csv"));

        let reloaded = Config::load_with(dir.path()).unwrap();
        assert_eq!(reloaded.search.board_top_k, config.search.board_top_k);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "embedding:\n  dimensions: 0\n").unwrap();

        assert!(Config::load_with(dir.path()).is_err());
    }
}

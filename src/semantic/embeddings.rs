//! Embedding providers.
//!
//! The similarity core only depends on [`EmbeddingProvider`]: image bytes or
//! text in, a raw dense vector out, both in one shared space. [`ClipEmbedder`]
//! is the local implementation on top of fastembed's CLIP ViT-B/32 pair.

use fastembed::{ImageEmbedding, ImageInitOptions, InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Mutex;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding timed out after {0} ms")]
    Timeout(u128),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Source of raw embeddings. Outputs are not assumed to be unit-norm.
pub trait EmbeddingProvider: Send + Sync {
    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn dimensions(&self) -> usize;

    /// Name of the model, stamped into persisted indexes.
    fn model_name(&self) -> &str;

    /// SHA256 of the model name, used to detect indexes built by another model.
    fn model_id(&self) -> [u8; 32] {
        model_id_hash(self.model_name())
    }
}

pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// CLIP image and text encoders sharing one embedding space.
/// Each model sits behind a Mutex because fastembed's embed calls need &mut self.
pub struct ClipEmbedder {
    image_model: Mutex<ImageEmbedding>,
    text_model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl ClipEmbedder {
    /// Load (downloading on first use) the image and text halves of `model_name`.
    ///
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let (image_enum, text_enum) = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let image_model = ImageEmbedding::try_new(
            ImageInitOptions::new(image_enum)
                .with_cache_dir(models_dir.clone())
                .with_show_download_progress(true),
        )
        .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let mut text_model = TextEmbedding::try_new(
            InitOptions::new(text_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true),
        )
        .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut text_model)?;
        log::info!("loaded embedding model '{}' ({} dimensions)", model_name, dimensions);

        Ok(Self {
            image_model: Mutex::new(image_model),
            text_model: Mutex::new(text_model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    fn parse_model_name(
        name: &str,
    ) -> Result<(fastembed::ImageEmbeddingModel, fastembed::EmbeddingModel), EmbeddingError> {
        match name.to_lowercase().as_str() {
            "clip-vit-b-32" | "clipvitb32" | "openai/clip-vit-base-patch32" => Ok((
                fastembed::ImageEmbeddingModel::ClipVitB32,
                fastembed::EmbeddingModel::ClipVitB32,
            )),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: clip-vit-b-32",
                name
            ))),
        }
    }

    /// Probe the text model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let probe = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        probe
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl EmbeddingProvider for ClipEmbedder {
    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.image_model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed_bytes(&[bytes], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.text_model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires model download"]
    fn test_clip_shared_space() {
        let temp_dir = std::env::temp_dir().join("vibe-embed-test");
        let model = ClipEmbedder::new("clip-vit-b-32", temp_dir.clone()).unwrap();
        assert_eq!(model.dimensions(), 512);

        let embedding = model.embed_text("red floral dress").unwrap();
        assert_eq!(embedding.len(), 512);

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = std::env::temp_dir().join("vibe-embed-invalid");
        let result = ClipEmbedder::new("bge-base-en-v1.5", temp_dir);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_model_id_hash_is_stable_and_distinct() {
        assert_eq!(model_id_hash("clip-vit-b-32"), model_id_hash("clip-vit-b-32"));
        assert_ne!(model_id_hash("clip-vit-b-32"), model_id_hash("clip-vit-l-14"));
    }
}

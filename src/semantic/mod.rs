//! Multi-modal similarity search over catalog images.
//!
//! Images and text are embedded into one shared space, normalized to unit
//! length and matched by inner product against an in-memory index.
//!
//! # Architecture
//!
//! - `normalize`: unit-length vectors and board aggregation
//! - `index`: append-only flat index with exact top-k search
//! - `id_map`: index ordinal to catalog id
//! - `snapshot`: index + id map published as one immutable unit
//! - `storage`: the persisted index/id-map pair
//! - `embeddings`: CLIP image and text embeddings via fastembed
//! - `orchestrator`: turns a query intent into ranked catalog records
//! - `builder`: builds, appends, persists and publishes snapshots

pub mod builder;
pub mod deadline;
pub mod embeddings;
pub mod id_map;
pub mod index;
pub mod normalize;
pub mod orchestrator;
pub mod snapshot;
pub mod storage;

pub use builder::{BuildError, BuildSummary, IndexBuilder, IndexManager};
pub use embeddings::{ClipEmbedder, EmbeddingError, EmbeddingProvider};
pub use id_map::{IdMap, UnknownOrdinalError};
pub use index::{IndexError, Ordinal, SearchHit, SimilarityIndex};
pub use normalize::{mean_direction, normalize, DegenerateVectorError, UnitVector};
pub use orchestrator::{
    BoardResults, ErrorClass, OrchestratorSettings, QueryIntent, QueryOrchestrator, RankedResult,
    SearchError, SkippedImage,
};
pub use snapshot::{BuildTag, IndexSnapshot, SnapshotHandle};
pub use storage::{IndexStorage, IndexStorageError};

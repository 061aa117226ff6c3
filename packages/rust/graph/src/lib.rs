//! Technique knowledge graph for Treeward.
//!
//! Parses technique bundles, embeds every technique, caches the result on
//! disk per embedding model and serves cosine-similarity search over it.

pub mod builder;
pub mod bundle;
pub mod embedding;
pub mod search;
pub mod store;

pub use builder::{GraphBuilder, get_or_build};
pub use bundle::{AttackPattern, Bundle, CourseOfAction, Relationship, StixObject};
pub use embedding::{
    EmbeddingModel, EmbeddingService, HashingEmbedder, ModelLoader, OllamaEmbedder,
    OpenAiEmbedder, load_model,
};
pub use search::{MatchResult, SearchStatistics, VectorSearch};
pub use store::TechniqueGraphStore;

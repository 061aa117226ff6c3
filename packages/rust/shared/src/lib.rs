//! Shared types, error model, and configuration for Treeward.
//!
//! This crate is the foundation depended on by all other Treeward crates.
//! It provides:
//! - [`TreewardError`]: the unified error type
//! - Technique graph types ([`TechniqueGraph`], [`TechniqueNode`], [`Confidence`])
//! - Typed stage payloads ([`ExtractionReport`], [`AttackTree`], [`MappingReport`], ...)
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod reports;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AgentsConfig, AppConfig, DEFAULT_HASHING_DIMENSION, EmbeddingConfig, EmbeddingProvider,
    MatchingConfig, PathsConfig, ProgressConfig, config_dir, config_file_path, expand_home,
    init_config, load_config, load_config_from, validate_embeddings,
};
pub use error::{Result, TreewardError};
pub use reports::{
    AttackTree, ContextReport, ExtractionReport, MappedTree, MappingReport, MappingSummary,
    Mitigation, SetupReport, SummaryReport, ThreatStatement, TtcMapping,
};
pub use types::{Confidence, RunId, TechniqueGraph, TechniqueNode};

//! Technique mapping for attack trees.
//!
//! Extracts attack steps from Mermaid trees, matches them against the
//! technique graph with domain-term re-ranking and attaches mitigations.

pub mod matcher;
pub mod mitigations;
pub mod steps;
pub mod trees;

pub use matcher::{
    DEFAULT_MIN_SIMILARITY, DOMAIN_TERMS, MAX_BOOST, StepMatches, TechniqueMatch,
    TechniqueMatcher, boost_factor, domain_terms,
};
pub use mitigations::MitigationIndex;
pub use steps::extract_attack_steps;
pub use trees::{TreeProgress, map_tree, map_trees, summarize};

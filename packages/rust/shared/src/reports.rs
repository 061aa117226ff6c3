//! Typed per-stage result payloads.
//!
//! Each workflow stage produces exactly one of these. They are stored in the
//! workflow checkpoint and handed to later stages, so the orchestrator and the
//! stage collaborators agree on their shape at compile time.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::Confidence;

/// Output of the setup stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupReport {
    /// Canonical project directory under analysis.
    pub project_path: PathBuf,
    /// Language model the agents were configured with.
    pub model: String,
    /// Free-form validation notes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub notes: BTreeMap<String, String>,
}

/// Output of the context-analysis stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextReport {
    /// Relevant files grouped by category (e.g. `infrastructure`, `docs`).
    #[serde(default)]
    pub files: BTreeMap<String, Vec<PathBuf>>,
    /// Short description of the project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// One threat statement produced by extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatStatement {
    pub id: String,
    pub statement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

/// Output of the extraction stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
    #[serde(default)]
    pub threat_statements: Vec<ThreatStatement>,
}

/// One generated attack tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackTree {
    pub threat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Mermaid source, optionally wrapped in a fenced code block.
    pub mermaid_code: String,
    /// File the tree was written to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// A mitigation recommended for a technique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mitigation {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// How this mitigation addresses the specific technique.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub relationship_description: String,
}

/// Best technique match for one attack step of a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtcMapping {
    pub attack_step: String,
    pub technique_id: String,
    pub technique_name: String,
    pub similarity: f32,
    pub confidence: Confidence,
    #[serde(default)]
    pub tactics: Vec<String>,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mitigations: Vec<Mitigation>,
}

/// An attack tree enriched with technique mappings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedTree {
    pub tree: AttackTree,
    #[serde(default)]
    pub ttc_mappings: Vec<TtcMapping>,
}

/// Aggregate numbers for the mapping stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingSummary {
    pub total_mappings: usize,
    /// Mappings whose similarity reached `threshold_used`.
    pub successful_mappings: usize,
    pub threshold_used: f32,
    /// Embedding model behind the matches.
    pub model: String,
}

/// Output of the mapping stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingReport {
    pub trees: Vec<MappedTree>,
    pub summary: MappingSummary,
}

/// Output of the summary stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryReport {
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
}

//! Core domain types for the technique graph.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for workflow run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// TechniqueNode
// ---------------------------------------------------------------------------

/// One adversary technique with its embedding vector.
///
/// Field names on disk follow the graph file format (`id`, `stix_id`,
/// `technique_ids`, `metadata`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechniqueNode {
    /// Stable key derived from the primary external id.
    #[serde(rename = "id")]
    pub internal_id: String,
    /// Identifier of the object in the source bundle.
    #[serde(rename = "stix_id", alias = "source_id")]
    pub source_id: String,
    /// Technique name.
    pub name: String,
    /// Full description.
    pub description: String,
    /// Public identifiers, primary first (e.g. `["T1190"]`).
    #[serde(rename = "technique_ids")]
    pub external_ids: Vec<String>,
    /// Tactic (kill-chain phase) names.
    pub tactics: BTreeSet<String>,
    /// Embedding of `"<name>: <description>"`.
    pub embedding: Vec<f32>,
    /// Provenance such as `created` / `modified` timestamps.
    #[serde(default, rename = "metadata")]
    pub extra_metadata: BTreeMap<String, Value>,
}

impl TechniqueNode {
    /// The primary public identifier, or `""` when the technique has none.
    pub fn primary_external_id(&self) -> &str {
        self.external_ids.first().map(String::as_str).unwrap_or("")
    }

    /// Text that domain-term re-ranking inspects.
    pub fn search_text(&self) -> String {
        format!("{} {}", self.name, self.description)
    }
}

// ---------------------------------------------------------------------------
// TechniqueGraph
// ---------------------------------------------------------------------------

/// The full technique catalogue, embedded with a single model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechniqueGraph {
    /// Techniques in bundle order.
    pub techniques: Vec<TechniqueNode>,
    /// Model that produced every embedding in this graph.
    pub embedding_model: String,
    /// Length of every embedding in this graph.
    pub embedding_dim: usize,
    /// When the graph was built. Timestamps without an offset are read as UTC.
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    /// Version string of the source bundle.
    #[serde(rename = "stix_version", alias = "source_version")]
    pub source_version: String,
    /// Provenance (source path, source checksum, technique count).
    #[serde(default, rename = "metadata")]
    pub extra_metadata: BTreeMap<String, Value>,
}

impl TechniqueGraph {
    /// Number of techniques.
    pub fn len(&self) -> usize {
        self.techniques.len()
    }

    /// Whether the graph holds no techniques.
    pub fn is_empty(&self) -> bool {
        self.techniques.is_empty()
    }

    /// Find a technique by any of its public identifiers (e.g. `T1190`).
    pub fn technique_by_external_id(&self, external_id: &str) -> Option<&TechniqueNode> {
        self.techniques
            .iter()
            .find(|t| t.external_ids.iter().any(|id| id == external_id))
    }

    /// Returns the first node whose embedding length disagrees with
    /// `embedding_dim`, if any.
    pub fn find_dimension_violation(&self) -> Option<&TechniqueNode> {
        self.techniques
            .iter()
            .find(|t| t.embedding.len() != self.embedding_dim)
    }
}

/// Accepts RFC 3339 as well as naive ISO 8601 (`2024-01-01T00:00:00.123456`).
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw:?}")))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Confidence
// ---------------------------------------------------------------------------

/// Coarse confidence bucket for a similarity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// `high` above 0.7, `medium` above 0.5, otherwise `low`.
    pub fn from_similarity(similarity: f32) -> Self {
        if similarity > 0.7 {
            Self::High
        } else if similarity > 0.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

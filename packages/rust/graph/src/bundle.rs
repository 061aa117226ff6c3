//! STIX bundle parsing.
//!
//! Only the object types the graph and mitigation index need are modelled;
//! everything else in the bundle deserializes to [`StixObject::Other`].

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use treeward_shared::{Result, TreewardError};

/// Source names whose `external_id` is a public technique identifier.
const TECHNIQUE_SOURCES: &[&str] = &["mitre-attack"];

/// Mitigation lookups also key on AAF identifiers.
const MITIGATION_SOURCES: &[&str] = &["mitre-attack", "aaf"];

/// Kill chain whose phases are used as tactics.
const TACTIC_KILL_CHAIN: &str = "mitre-attack";

/// A parsed bundle file.
#[derive(Debug, Clone, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub spec_version: Option<String>,
    #[serde(default)]
    pub objects: Vec<StixObject>,
    /// Hex SHA-256 of the file contents, when loaded from disk.
    #[serde(skip)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StixObject {
    #[serde(rename = "attack-pattern")]
    AttackPattern(AttackPattern),
    #[serde(rename = "course-of-action")]
    CourseOfAction(CourseOfAction),
    #[serde(rename = "relationship")]
    Relationship(Relationship),
    #[serde(rename = "x-mitre-collection")]
    Collection(Collection),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttackPattern {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub external_references: Vec<ExternalReference>,
    #[serde(default)]
    pub kill_chain_phases: Vec<KillChainPhase>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CourseOfAction {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Relationship {
    #[serde(default)]
    pub relationship_type: String,
    #[serde(default)]
    pub source_ref: String,
    #[serde(default)]
    pub target_ref: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Collection {
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalReference {
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillChainPhase {
    #[serde(default)]
    pub kill_chain_name: String,
    #[serde(default)]
    pub phase_name: String,
}

impl AttackPattern {
    /// Public ATT&CK technique identifiers, in bundle order.
    pub fn external_ids(&self) -> Vec<String> {
        self.ids_from(TECHNIQUE_SOURCES)
    }

    /// Identifiers that mitigation relationships may be keyed by (ATT&CK or AAF).
    pub fn mitigation_ids(&self) -> Vec<String> {
        self.ids_from(MITIGATION_SOURCES)
    }

    fn ids_from(&self, sources: &[&str]) -> Vec<String> {
        self.external_references
            .iter()
            .filter(|r| sources.contains(&r.source_name.as_str()))
            .filter_map(|r| r.external_id.clone())
            .filter(|id| !id.is_empty())
            .collect()
    }

    /// Tactic names from the ATT&CK kill chain.
    pub fn tactics(&self) -> impl Iterator<Item = &str> {
        self.kill_chain_phases
            .iter()
            .filter(|p| p.kill_chain_name == TACTIC_KILL_CHAIN && !p.phase_name.is_empty())
            .map(|p| p.phase_name.as_str())
    }
}

impl Relationship {
    pub fn is_mitigation(&self) -> bool {
        self.relationship_type == "mitigates"
    }
}

impl Bundle {
    /// Read and parse a bundle file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| TreewardError::io(path, e))?;
        let mut bundle: Bundle = serde_json::from_slice(&bytes)
            .map_err(|e| TreewardError::corrupt(path, format!("invalid bundle: {e}")))?;
        bundle.sha256 = Some(format!("{:x}", Sha256::digest(&bytes)));

        debug!(path = %path.display(), objects = bundle.objects.len(), "loaded bundle");
        Ok(bundle)
    }

    /// Parse a bundle from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TreewardError::validation(format!("invalid bundle: {e}")))
    }

    pub fn attack_patterns(&self) -> impl Iterator<Item = &AttackPattern> {
        self.objects.iter().filter_map(|o| match o {
            StixObject::AttackPattern(p) => Some(p),
            _ => None,
        })
    }

    pub fn courses_of_action(&self) -> impl Iterator<Item = &CourseOfAction> {
        self.objects.iter().filter_map(|o| match o {
            StixObject::CourseOfAction(c) => Some(c),
            _ => None,
        })
    }

    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.objects.iter().filter_map(|o| match o {
            StixObject::Relationship(r) => Some(r),
            _ => None,
        })
    }

    /// Version label for graphs built from this bundle.
    ///
    /// `ATT&CK-<x.y>` when a collection object names its ATT&CK release,
    /// else the bundle `spec_version`, else `unknown`.
    pub fn version(&self) -> String {
        static VERSION_RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"v(\d+\.\d+)").expect("valid regex"));

        for object in &self.objects {
            if let StixObject::Collection(c) = object {
                if !c.description.contains("ATT&CK") {
                    continue;
                }
                if let Some(caps) = VERSION_RE.captures(&c.description) {
                    return format!("ATT&CK-{}", &caps[1]);
                }
            }
        }

        self.spec_version
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_fixture() -> Bundle {
        let json = std::fs::read_to_string("../../../fixtures/json/bundle.fixture.json")
            .expect("read fixture");
        Bundle::from_json(&json).expect("parse fixture")
    }

    #[test]
    fn parses_fixture_objects() {
        let bundle = load_fixture();
        assert_eq!(bundle.attack_patterns().count(), 2);
        assert_eq!(bundle.courses_of_action().count(), 1);
        assert_eq!(bundle.relationships().filter(|r| r.is_mitigation()).count(), 1);
        // identity object is ignored but kept as Other
        assert!(bundle.objects.iter().any(|o| matches!(o, StixObject::Other)));
    }

    #[test]
    fn external_ids_and_tactics() {
        let bundle = load_fixture();
        let first = bundle.attack_patterns().next().expect("attack pattern");
        assert_eq!(first.external_ids(), vec!["T1530".to_string()]);
        assert_eq!(first.tactics().collect::<Vec<_>>(), vec!["collection"]);
    }

    #[test]
    fn version_from_collection() {
        assert_eq!(load_fixture().version(), "ATT&CK-15.1");
    }

    #[test]
    fn version_falls_back_to_spec_version_then_unknown() {
        let bundle = Bundle::from_json(
            r#"{"type":"bundle","spec_version":"2.0","objects":[
                {"type":"x-mitre-collection","description":"Some other collection v3.2"}
            ]}"#,
        )
        .expect("parse");
        assert_eq!(bundle.version(), "2.0");

        let bundle = Bundle::from_json(r#"{"type":"bundle","objects":[]}"#).expect("parse");
        assert_eq!(bundle.version(), "unknown");
    }

    #[test]
    fn ignores_foreign_references_and_kill_chains() {
        let bundle = Bundle::from_json(
            r#"{"objects":[{
                "type":"attack-pattern","id":"attack-pattern--x","name":"X",
                "external_references":[
                    {"source_name":"capec","external_id":"CAPEC-1"},
                    {"source_name":"aaf","external_id":"AAF-7"},
                    {"source_name":"mitre-attack"}
                ],
                "kill_chain_phases":[
                    {"kill_chain_name":"lockheed","phase_name":"delivery"},
                    {"kill_chain_name":"mitre-attack","phase_name":"execution"}
                ]
            }]}"#,
        )
        .expect("parse");
        let pattern = bundle.attack_patterns().next().expect("attack pattern");
        assert!(pattern.external_ids().is_empty());
        assert_eq!(pattern.mitigation_ids(), vec!["AAF-7".to_string()]);
        assert_eq!(pattern.tactics().collect::<Vec<_>>(), vec!["execution"]);
    }

    #[test]
    fn load_reports_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bundle.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(matches!(
            Bundle::load(&path).unwrap_err(),
            TreewardError::Corrupt { .. }
        ));

        let loaded = Bundle::load(&std::path::PathBuf::from(
            "../../../fixtures/json/bundle.fixture.json",
        ))
        .expect("load fixture");
        assert_eq!(loaded.sha256.as_deref().map(str::len), Some(64));
    }
}

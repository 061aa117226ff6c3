//! Technique → mitigation lookup built from the same bundle as the graph.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use treeward_graph::Bundle;
use treeward_shared::{Mitigation, Result};

/// Mitigations keyed by public technique id (e.g. `T1530`).
#[derive(Debug, Clone, Default)]
pub struct MitigationIndex {
    by_technique: HashMap<String, Vec<Mitigation>>,
}

impl MitigationIndex {
    pub fn load(path: &Path) -> Result<Self> {
        let bundle = Bundle::load(path)?;
        Ok(Self::from_bundle(&bundle))
    }

    /// Index every `mitigates` relationship whose endpoints are both known.
    pub fn from_bundle(bundle: &Bundle) -> Self {
        let pattern_ids: HashMap<&str, String> = bundle
            .attack_patterns()
            .filter_map(|p| p.mitigation_ids().into_iter().next().map(|id| (p.id.as_str(), id)))
            .collect();

        let courses: HashMap<&str, (&str, &str)> = bundle
            .courses_of_action()
            .map(|c| (c.id.as_str(), (c.name.as_str(), c.description.as_str())))
            .collect();

        let mut by_technique: HashMap<String, Vec<Mitigation>> = HashMap::new();
        for rel in bundle.relationships().filter(|r| r.is_mitigation()) {
            let (Some(technique_id), Some((name, description))) = (
                pattern_ids.get(rel.target_ref.as_str()),
                courses.get(rel.source_ref.as_str()),
            ) else {
                continue;
            };

            by_technique
                .entry(technique_id.clone())
                .or_default()
                .push(Mitigation {
                    name: name.to_string(),
                    description: description.to_string(),
                    relationship_description: rel.description.clone(),
                });
        }

        info!(techniques = by_technique.len(), "indexed mitigations");
        Self { by_technique }
    }

    pub fn get(&self, technique_id: &str) -> &[Mitigation] {
        self.by_technique
            .get(technique_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of techniques with at least one mitigation.
    pub fn len(&self) -> usize {
        self.by_technique.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_technique.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_fixture_mitigations() {
        let index = MitigationIndex::load(Path::new("../../../fixtures/json/bundle.fixture.json"))
            .expect("load fixture");
        assert_eq!(index.len(), 1);

        let mitigations = index.get("T1530");
        assert_eq!(mitigations.len(), 1);
        assert_eq!(mitigations[0].name, "Restrict File and Directory Permissions");
        assert_eq!(
            mitigations[0].relationship_description,
            "Use access control lists on cloud storage buckets."
        );
        assert!(index.get("T1190").is_empty());
    }

    #[test]
    fn skips_dangling_relationships() {
        let bundle = Bundle::from_json(
            r#"{"objects":[
                {"type":"relationship","relationship_type":"mitigates",
                 "source_ref":"course-of-action--missing","target_ref":"attack-pattern--missing"},
                {"type":"relationship","relationship_type":"uses",
                 "source_ref":"intrusion-set--a","target_ref":"attack-pattern--b"}
            ]}"#,
        )
        .expect("parse");
        assert!(MitigationIndex::from_bundle(&bundle).is_empty());
    }

    #[test]
    fn aaf_identified_patterns_still_get_mitigations() {
        let bundle = Bundle::from_json(
            r#"{"objects":[
                {"type":"attack-pattern","id":"attack-pattern--aaf","name":"Model Theft",
                 "external_references":[{"source_name":"aaf","external_id":"AAF-7"}]},
                {"type":"course-of-action","id":"course-of-action--1","name":"Rate Limit Inference",
                 "description":"Throttle model queries."},
                {"type":"relationship","relationship_type":"mitigates",
                 "source_ref":"course-of-action--1","target_ref":"attack-pattern--aaf"}
            ]}"#,
        )
        .expect("parse");
        let index = MitigationIndex::from_bundle(&bundle);
        assert_eq!(index.get("AAF-7").len(), 1);
        assert_eq!(index.get("AAF-7")[0].name, "Rate Limit Inference");
        assert!(bundle.attack_patterns().all(|p| p.external_ids().is_empty()));
    }
}

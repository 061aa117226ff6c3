//! Durable storage for a technique graph.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use treeward_shared::{PathsConfig, Result, TechniqueGraph, TreewardError};

/// Reads and writes one technique graph file.
#[derive(Debug, Clone)]
pub struct TechniqueGraphStore {
    path: PathBuf,
}

/// The part of a graph file that staleness checks need.
#[derive(Deserialize)]
struct GraphHeader {
    embedding_model: String,
    #[serde(default)]
    embedding_dim: Option<usize>,
}

impl TechniqueGraphStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for the graph embedded with `embedding_model` under the configured graph dir.
    pub fn for_model(paths: &PathsConfig, embedding_model: &str) -> Self {
        Self::new(paths.graph_file(embedding_model))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load the graph, rejecting files whose nodes disagree with `embedding_dim`.
    pub fn load(&self) -> Result<TechniqueGraph> {
        if !self.exists() {
            return Err(TreewardError::not_found("technique graph", &self.path));
        }

        let bytes = std::fs::read(&self.path).map_err(|e| TreewardError::io(&self.path, e))?;
        let graph: TechniqueGraph = serde_json::from_slice(&bytes)
            .map_err(|e| TreewardError::corrupt(&self.path, e.to_string()))?;

        if let Some(node) = graph.find_dimension_violation() {
            return Err(TreewardError::corrupt(
                &self.path,
                format!(
                    "technique {} has a {}-dimensional embedding, graph declares {}",
                    node.internal_id,
                    node.embedding.len(),
                    graph.embedding_dim
                ),
            ));
        }

        info!(
            path = %self.path.display(),
            techniques = graph.len(),
            model = %graph.embedding_model,
            version = %graph.source_version,
            "loaded technique graph"
        );
        Ok(graph)
    }

    /// Write the graph through a sibling temp file and rename it into place.
    pub fn save(&self, graph: &TechniqueGraph) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| TreewardError::io(parent, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "technique_graph.json".to_string());
        let temp = parent.join(format!(".{file_name}.tmp"));

        let json = serde_json::to_vec(graph)
            .map_err(|e| TreewardError::validation(format!("serialize graph: {e}")))?;
        std::fs::write(&temp, json).map_err(|e| TreewardError::io(&temp, e))?;
        std::fs::rename(&temp, &self.path).map_err(|e| TreewardError::io(&self.path, e))?;

        info!(path = %self.path.display(), techniques = graph.len(), "saved technique graph");
        Ok(())
    }

    /// Whether the stored graph must be rebuilt.
    ///
    /// Model identity is compared before timestamps: a graph embedded with a
    /// different model, or with the same model at another dimension, is stale
    /// even when it is newer than the bundle. `expected_dim` of `None` skips
    /// the dimension check.
    pub fn is_stale(
        &self,
        bundle_path: &Path,
        expected_model: &str,
        expected_dim: Option<usize>,
    ) -> bool {
        if !self.exists() {
            return true;
        }

        match self.read_header() {
            Ok(header) if header.embedding_model != expected_model => {
                info!(
                    stored = %header.embedding_model,
                    expected = %expected_model,
                    "graph was embedded with a different model"
                );
                return true;
            }
            Ok(header) if expected_dim.is_some() && header.embedding_dim != expected_dim => {
                info!(
                    stored = ?header.embedding_dim,
                    expected = ?expected_dim,
                    "graph has a different embedding dimension"
                );
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not read graph header");
                return true;
            }
        }

        let bundle_mtime = match std::fs::metadata(bundle_path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => {
                debug!(bundle = %bundle_path.display(), "bundle missing, keeping graph");
                return false;
            }
        };
        let graph_mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => return true,
        };

        bundle_mtime > graph_mtime
    }

    fn read_header(&self) -> Result<GraphHeader> {
        let bytes = std::fs::read(&self.path).map_err(|e| TreewardError::io(&self.path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| TreewardError::corrupt(&self.path, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::{Duration, SystemTime};

    use chrono::Utc;
    use treeward_shared::TechniqueNode;

    use super::*;

    fn sample_graph(model: &str) -> TechniqueGraph {
        TechniqueGraph {
            techniques: vec![TechniqueNode {
                internal_id: "technique-T1530".into(),
                source_id: "attack-pattern--1".into(),
                name: "Data from Cloud Storage".into(),
                description: "Access data in a bucket.".into(),
                external_ids: vec!["T1530".into()],
                tactics: BTreeSet::from(["collection".to_string()]),
                embedding: vec![0.6, 0.8],
                extra_metadata: BTreeMap::new(),
            }],
            embedding_model: model.into(),
            embedding_dim: 2,
            created_at: Utc::now(),
            source_version: "ATT&CK-15.1".into(),
            extra_metadata: BTreeMap::new(),
        }
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .expect("open");
        file.set_modified(time).expect("set mtime");
    }

    #[test]
    fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TechniqueGraphStore::new(dir.path().join("graph.json"));
        assert!(!store.exists());
        assert!(matches!(store.load().unwrap_err(), TreewardError::NotFound { .. }));
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TechniqueGraphStore::new(dir.path().join("nested/graph.json"));
        let graph = sample_graph("hashing-2");

        store.save(&graph).expect("save");
        assert!(store.exists());
        assert!(!dir.path().join("nested/.graph.json.tmp").exists());
        assert_eq!(store.load().expect("load"), graph);
    }

    #[test]
    fn load_rejects_garbage_and_dimension_violations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TechniqueGraphStore::new(dir.path().join("graph.json"));

        std::fs::write(store.path(), r#"{"techniques": []}"#).expect("write");
        assert!(matches!(store.load().unwrap_err(), TreewardError::Corrupt { .. }));

        let mut graph = sample_graph("hashing-2");
        graph.techniques[0].embedding.push(0.0);
        store.save(&graph).expect("save");
        assert!(matches!(store.load().unwrap_err(), TreewardError::Corrupt { .. }));
    }

    #[test]
    fn stale_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TechniqueGraphStore::new(dir.path().join("graph.json"));
        assert!(store.is_stale(&dir.path().join("bundle.json"), "hashing-2", None));
    }

    #[test]
    fn model_mismatch_is_stale_regardless_of_timestamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bundle = dir.path().join("bundle.json");
        std::fs::write(&bundle, "{}").expect("write bundle");

        let store = TechniqueGraphStore::new(dir.path().join("graph.json"));
        store.save(&sample_graph("hashing-2")).expect("save");

        // graph strictly newer than the bundle
        let now = SystemTime::now();
        set_mtime(&bundle, now - Duration::from_secs(3600));
        set_mtime(store.path(), now);

        assert!(!store.is_stale(&bundle, "hashing-2", Some(2)));
        assert!(store.is_stale(&bundle, "nomic-embed-text", Some(2)));
    }

    #[test]
    fn dimension_mismatch_under_same_model_is_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bundle = dir.path().join("bundle.json");
        std::fs::write(&bundle, "{}").expect("write bundle");

        let store = TechniqueGraphStore::new(dir.path().join("graph.json"));
        store.save(&sample_graph("hashing")).expect("save");

        let now = SystemTime::now();
        set_mtime(&bundle, now - Duration::from_secs(3600));
        set_mtime(store.path(), now);

        assert!(!store.is_stale(&bundle, "hashing", Some(2)));
        assert!(!store.is_stale(&bundle, "hashing", None));
        assert!(store.is_stale(&bundle, "hashing", Some(32)));
    }

    #[test]
    fn loads_graph_written_with_naive_timestamp_and_numeric_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TechniqueGraphStore::new(dir.path().join("graph.json"));
        std::fs::write(
            store.path(),
            r#"{
                "techniques": [{
                    "id": "technique-T1530",
                    "stix_id": "attack-pattern--1",
                    "name": "Data from Cloud Storage",
                    "description": "Access data in a bucket.",
                    "technique_ids": ["T1530"],
                    "tactics": ["collection"],
                    "embedding": [0.6, 0.8],
                    "metadata": {"created": "2019-08-30T18:07:27.741Z", "modified": "2024-04-15T19:57:06.563Z"}
                }],
                "embedding_model": "all-MiniLM-L6-v2",
                "embedding_dim": 2,
                "created_at": "2024-01-01T00:00:00.123456",
                "stix_version": "15.1",
                "metadata": {"source": "b.json", "num_techniques": 1}
            }"#,
        )
        .expect("write");

        let graph = store.load().expect("load");
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.created_at.to_rfc3339(), "2024-01-01T00:00:00.123456+00:00");
        assert_eq!(graph.extra_metadata["num_techniques"], 1);
        assert_eq!(graph.techniques[0].primary_external_id(), "T1530");
        assert!(!store.is_stale(&dir.path().join("absent.json"), "all-MiniLM-L6-v2", Some(2)));
    }

    #[test]
    fn newer_bundle_is_stale_and_missing_bundle_is_not() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bundle = dir.path().join("bundle.json");
        std::fs::write(&bundle, "{}").expect("write bundle");

        let store = TechniqueGraphStore::new(dir.path().join("graph.json"));
        store.save(&sample_graph("hashing-2")).expect("save");

        let now = SystemTime::now();
        set_mtime(store.path(), now - Duration::from_secs(3600));
        set_mtime(&bundle, now);
        assert!(store.is_stale(&bundle, "hashing-2", None));

        assert!(!store.is_stale(&dir.path().join("absent.json"), "hashing-2", None));
    }

    #[test]
    fn unreadable_header_is_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TechniqueGraphStore::new(dir.path().join("graph.json"));
        std::fs::write(store.path(), "not json").expect("write");
        assert!(store.is_stale(&dir.path().join("bundle.json"), "hashing-2", None));
    }

    #[test]
    fn per_model_file_name() {
        let paths = PathsConfig {
            graph_dir: "/var/graphs".into(),
            ..Default::default()
        };
        let store = TechniqueGraphStore::for_model(&paths, "sentence-transformers/all-MiniLM-L6-v2");
        assert_eq!(
            store.path(),
            Path::new("/var/graphs/technique_graph_sentence-transformers_all-MiniLM-L6-v2.json")
        );
    }
}

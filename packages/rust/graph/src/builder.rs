//! Technique graph construction and the cache-aside entry point.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};

use treeward_shared::{Result, TechniqueGraph, TechniqueNode, TreewardError};

use crate::bundle::Bundle;
use crate::embedding::EmbeddingService;
use crate::store::TechniqueGraphStore;

/// Builds technique graphs from bundles using one embedding service.
pub struct GraphBuilder<'a> {
    embeddings: &'a mut EmbeddingService,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(embeddings: &'a mut EmbeddingService) -> Self {
        Self { embeddings }
    }

    /// Extract every attack pattern from `bundle` and embed it.
    ///
    /// All technique texts go through a single `embed_batch` call.
    #[instrument(skip_all, fields(source = %source.display()))]
    pub fn build_from_bundle(&mut self, bundle: &Bundle, source: &Path) -> Result<TechniqueGraph> {
        let patterns: Vec<_> = bundle.attack_patterns().collect();
        info!(count = patterns.len(), "extracted techniques");

        let texts: Vec<String> = patterns
            .iter()
            .map(|p| format!("{}: {}", p.name, p.description))
            .collect();
        let vectors = self.embeddings.embed_batch(&texts)?;
        let dim = self.embeddings.dimension()?;

        let mut techniques = Vec::with_capacity(patterns.len());
        for (i, (pattern, embedding)) in patterns.iter().zip(vectors).enumerate() {
            if embedding.len() != dim {
                return Err(TreewardError::Model(format!(
                    "technique {} embedded to {} values, expected {dim}",
                    pattern.id,
                    embedding.len()
                )));
            }

            let external_ids = pattern.external_ids();
            let internal_id = match external_ids.first() {
                Some(primary) => format!("technique-{primary}"),
                None => format!("technique-tech-{i}"),
            };

            let mut extra_metadata = BTreeMap::new();
            extra_metadata.insert(
                "created".into(),
                Value::from(pattern.created.clone().unwrap_or_default()),
            );
            extra_metadata.insert(
                "modified".into(),
                Value::from(pattern.modified.clone().unwrap_or_default()),
            );

            techniques.push(TechniqueNode {
                internal_id,
                source_id: pattern.id.clone(),
                name: pattern.name.clone(),
                description: pattern.description.clone(),
                external_ids,
                tactics: pattern.tactics().map(str::to_string).collect::<BTreeSet<_>>(),
                embedding,
                extra_metadata,
            });
        }

        let mut extra_metadata = BTreeMap::new();
        extra_metadata.insert("source".into(), Value::from(source.display().to_string()));
        extra_metadata.insert("num_techniques".into(), Value::from(techniques.len()));
        if let Some(sha) = &bundle.sha256 {
            extra_metadata.insert("source_sha256".into(), Value::from(sha.as_str()));
        }

        let graph = TechniqueGraph {
            techniques,
            embedding_model: self.embeddings.model_name().to_string(),
            embedding_dim: dim,
            created_at: Utc::now(),
            source_version: bundle.version(),
            extra_metadata,
        };

        info!(
            techniques = graph.len(),
            dim,
            version = %graph.source_version,
            "technique graph built"
        );
        Ok(graph)
    }
}

/// Return a cached graph when it is present and fresh, otherwise build one,
/// save it and return it.
///
/// A cached graph that fails to load is rebuilt rather than reported.
#[instrument(skip_all, fields(graph = %store.path().display(), bundle = %bundle_path.display(), force_rebuild))]
pub fn get_or_build(
    store: &TechniqueGraphStore,
    bundle_path: &Path,
    embeddings: &mut EmbeddingService,
    force_rebuild: bool,
) -> Result<TechniqueGraph> {
    let dim = embeddings.dimension()?;
    let need_build = force_rebuild
        || !store.exists()
        || store.is_stale(bundle_path, embeddings.model_name(), Some(dim));

    if !need_build {
        match store.load() {
            Ok(graph) if graph.embedding_dim == dim => return Ok(graph),
            Ok(graph) => warn!(
                stored = graph.embedding_dim,
                expected = dim,
                "cached graph has a different embedding dimension, rebuilding"
            ),
            Err(e) => warn!(error = %e, "failed to load cached graph, rebuilding"),
        }
    }

    info!(model = %embeddings.model_name(), "building technique graph");
    let bundle = Bundle::load(bundle_path)?;
    let graph = GraphBuilder::new(embeddings).build_from_bundle(&bundle, bundle_path)?;
    store.save(&graph)?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    use treeward_shared::EmbeddingConfig;

    use super::*;
    use crate::embedding::HashingEmbedder;

    const FIXTURE: &str = "../../../fixtures/json/bundle.fixture.json";

    fn hashing_service(model: &str) -> EmbeddingService {
        hashing_service_with_dim(model, 64)
    }

    fn hashing_service_with_dim(model: &str, dimension: usize) -> EmbeddingService {
        EmbeddingService::new(EmbeddingConfig {
            model: model.into(),
            dimension: Some(dimension),
            ..Default::default()
        })
    }

    /// Hashing service that counts how many texts were embedded.
    fn counting_service(model: &str, counter: Arc<AtomicUsize>) -> EmbeddingService {
        struct Counting(HashingEmbedder, Arc<AtomicUsize>);
        impl crate::embedding::EmbeddingModel for Counting {
            fn dimension(&self) -> usize {
                self.0.dimension()
            }
            fn encode(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
                self.1.fetch_add(texts.len(), Ordering::SeqCst);
                self.0.encode(texts)
            }
        }

        EmbeddingService::with_loader(
            EmbeddingConfig {
                model: model.into(),
                dimension: Some(64),
                ..Default::default()
            },
            Box::new(
                move |_: &EmbeddingConfig| -> Result<Box<dyn crate::embedding::EmbeddingModel>> {
                    Ok(Box::new(Counting(HashingEmbedder::new(64), counter.clone())))
                },
            ),
        )
    }

    #[test]
    fn builds_two_technique_graph() {
        let bundle = Bundle::load(Path::new(FIXTURE)).expect("load fixture");
        let mut service = hashing_service("hashing-64");
        let graph = GraphBuilder::new(&mut service)
            .build_from_bundle(&bundle, Path::new(FIXTURE))
            .expect("build");

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.embedding_dim, 64);
        assert!(graph.techniques.iter().all(|t| t.embedding.len() == graph.embedding_dim));
        assert_eq!(graph.embedding_model, "hashing-64");
        assert_eq!(graph.source_version, "ATT&CK-15.1");

        let storage = graph.technique_by_external_id("T1530").expect("T1530");
        assert_eq!(storage.internal_id, "technique-T1530");
        assert!(storage.tactics.contains("collection"));
        assert_eq!(storage.extra_metadata["created"], "2019-08-30T18:07:27.741Z");
        assert_eq!(graph.extra_metadata["num_techniques"], 2);
        assert!(graph.extra_metadata.contains_key("source_sha256"));
    }

    #[test]
    fn technique_without_external_id_gets_positional_id() {
        let bundle = Bundle::from_json(
            r#"{"objects":[
                {"type":"attack-pattern","id":"attack-pattern--a","name":"A",
                 "external_references":[{"source_name":"mitre-attack","external_id":"T1000"}]},
                {"type":"attack-pattern","id":"attack-pattern--b","name":"B"}
            ]}"#,
        )
        .expect("parse");
        let mut service = hashing_service("hashing-64");
        let graph = GraphBuilder::new(&mut service)
            .build_from_bundle(&bundle, Path::new("inline.json"))
            .expect("build");
        assert_eq!(graph.techniques[1].internal_id, "technique-tech-1");
        assert!(graph.techniques[1].external_ids.is_empty());
    }

    #[test]
    fn get_or_build_uses_cache_when_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bundle_path = dir.path().join("bundle.json");
        std::fs::copy(FIXTURE, &bundle_path).expect("copy fixture");
        let store = TechniqueGraphStore::new(dir.path().join("graph.json"));

        let counter = Arc::new(AtomicUsize::new(0));
        let mut service = counting_service("hashing-64", counter.clone());

        let first = get_or_build(&store, &bundle_path, &mut service, false).expect("build");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(store.exists());

        // make the bundle clearly older than the graph
        let old = SystemTime::now() - Duration::from_secs(3600);
        std::fs::OpenOptions::new()
            .write(true)
            .open(&bundle_path)
            .expect("open")
            .set_modified(old)
            .expect("mtime");

        let second = get_or_build(&store, &bundle_path, &mut service, false).expect("load");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(first, second);

        get_or_build(&store, &bundle_path, &mut service, true).expect("forced");
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn get_or_build_rebuilds_on_model_change_and_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bundle_path = PathBuf::from(FIXTURE);
        let store = TechniqueGraphStore::new(dir.path().join("graph.json"));

        let mut service = hashing_service("hashing-64");
        get_or_build(&store, &bundle_path, &mut service, false).expect("build");
        assert!(store.is_stale(&bundle_path, "other-model", Some(64)));

        let mut other = hashing_service("other-model");
        let rebuilt = get_or_build(&store, &bundle_path, &mut other, false).expect("rebuild");
        assert_eq!(rebuilt.embedding_model, "other-model");

        // a graph that parses its header but not its body is rebuilt silently
        std::fs::write(
            store.path(),
            r#"{"embedding_model":"other-model","techniques":"oops"}"#,
        )
        .expect("corrupt");
        let recovered = get_or_build(&store, &bundle_path, &mut other, false).expect("recover");
        assert_eq!(recovered.len(), 2);
    }

    #[test]
    fn get_or_build_rebuilds_when_dimension_changes_under_same_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bundle_path = PathBuf::from(FIXTURE);
        let store = TechniqueGraphStore::new(dir.path().join("graph.json"));

        let mut wide = hashing_service_with_dim("hashing", 64);
        let first = get_or_build(&store, &bundle_path, &mut wide, false).expect("build");
        assert_eq!(first.embedding_dim, 64);

        let mut narrow = hashing_service_with_dim("hashing", 32);
        let second = get_or_build(&store, &bundle_path, &mut narrow, false).expect("rebuild");
        assert_eq!(second.embedding_dim, 32);
        assert!(second.techniques.iter().all(|t| t.embedding.len() == 32));
        assert_eq!(store.load().expect("load").embedding_dim, 32);
    }
}

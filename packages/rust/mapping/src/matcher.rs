//! Attack step → technique matching with domain-term re-ranking.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use treeward_graph::{
    EmbeddingService, MatchResult, SearchStatistics, TechniqueGraphStore, VectorSearch,
    get_or_build,
};
use treeward_shared::{AppConfig, Confidence, EmbeddingConfig, Result, TechniqueGraph, TreewardError};

/// Default minimum similarity for a match to be reported.
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.3;

/// Upper bound on the domain-term boost multiplier.
pub const MAX_BOOST: f32 = 1.5;

/// Cloud platform vocabulary used for re-ranking.
pub const DOMAIN_TERMS: &[&str] = &[
    "aws",
    "s3",
    "ec2",
    "iam",
    "lambda",
    "dynamodb",
    "rds",
    "ecs",
    "cloudformation",
    "cloudwatch",
    "sns",
    "sqs",
    "kinesis",
    "athena",
    "glue",
    "emr",
    "eks",
    "fargate",
    "bucket",
    "instance",
    "role",
    "cloudtrail",
    "kms",
    "secrets",
    "parameter",
    "api",
    "gateway",
];

/// Domain terms occurring anywhere in `text`, case-insensitively.
pub fn domain_terms(text: &str) -> BTreeSet<&'static str> {
    let lower = text.to_lowercase();
    DOMAIN_TERMS
        .iter()
        .copied()
        .filter(|term| lower.contains(term))
        .collect()
}

/// Multiplier for `shared` domain terms: `min(1 + 0.1 * shared, 1.5)`.
pub fn boost_factor(shared: usize) -> f32 {
    (1.0 + 0.1 * shared as f32).min(MAX_BOOST)
}

/// A technique matched to a step, detached from the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechniqueMatch {
    pub technique_id: String,
    pub name: String,
    pub description: String,
    pub tactics: Vec<String>,
    /// Similarity after domain-term boosting.
    pub similarity: f32,
    pub confidence: Confidence,
}

impl TechniqueMatch {
    fn from_hit(hit: &MatchResult<'_>, similarity: f32) -> Self {
        let technique = hit.technique;
        Self {
            technique_id: technique.primary_external_id().to_string(),
            name: technique.name.clone(),
            description: technique.description.clone(),
            tactics: technique.tactics.iter().cloned().collect(),
            similarity,
            confidence: Confidence::from_similarity(similarity),
        }
    }
}

/// Matches for one attack step, best first. Never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMatches {
    pub step: String,
    pub matches: Vec<TechniqueMatch>,
}

/// Where a lazily loaded index comes from.
#[derive(Debug, Clone)]
struct IndexSource {
    embeddings: EmbeddingConfig,
    store: TechniqueGraphStore,
    bundle: PathBuf,
}

struct LoadedIndex {
    embeddings: EmbeddingService,
    search: VectorSearch,
}

/// Maps free-text attack steps onto techniques.
///
/// The graph and embedding model are loaded on the first call that needs
/// them, through the graph cache.
pub struct TechniqueMatcher {
    min_similarity: f32,
    source: Option<IndexSource>,
    index: Option<LoadedIndex>,
}

impl TechniqueMatcher {
    /// Matcher backed by the configured graph cache and bundle.
    pub fn new(config: &AppConfig) -> Self {
        Self {
            min_similarity: config.matching.min_similarity,
            source: Some(IndexSource {
                embeddings: config.embeddings.clone(),
                store: TechniqueGraphStore::for_model(&config.paths, &config.embeddings.model),
                bundle: config.paths.bundle(),
            }),
            index: None,
        }
    }

    /// Matcher over an already built graph.
    pub fn with_index(
        embeddings: EmbeddingService,
        graph: TechniqueGraph,
        min_similarity: f32,
    ) -> Result<Self> {
        if graph.embedding_model != embeddings.model_name() {
            return Err(TreewardError::Model(format!(
                "graph was embedded with {}, service uses {}",
                graph.embedding_model,
                embeddings.model_name()
            )));
        }
        Ok(Self {
            min_similarity,
            source: None,
            index: Some(LoadedIndex {
                embeddings,
                search: VectorSearch::new(graph)?,
            }),
        })
    }

    pub fn min_similarity(&self) -> f32 {
        self.min_similarity
    }

    /// Embedding model behind the matches.
    pub fn model_name(&self) -> &str {
        match (&self.index, &self.source) {
            (Some(index), _) => index.embeddings.model_name(),
            (None, Some(source)) => &source.embeddings.model,
            (None, None) => "",
        }
    }

    pub fn statistics(&mut self) -> Result<SearchStatistics> {
        Ok(self.index()?.search.statistics())
    }

    /// Match each step to at most `top_k` techniques.
    ///
    /// Results are searched with a floor of `min_similarity / MAX_BOOST`, boosted
    /// by shared domain terms, then kept only if the boosted score reaches
    /// `min_similarity`. Steps that fail to embed or match nothing are left out.
    #[instrument(skip_all, fields(steps = steps.len(), top_k))]
    pub fn match_steps(&mut self, steps: &[String], top_k: usize) -> Result<Vec<StepMatches>> {
        let min_similarity = self.min_similarity;
        let search_floor = min_similarity / MAX_BOOST;
        let LoadedIndex { embeddings, search } = self.index()?;

        let mut results = Vec::new();
        for step in steps {
            let embedding = match embeddings.embed(step) {
                Ok(v) if !v.is_empty() => v,
                Ok(_) => {
                    warn!(step = %truncate(step), "empty embedding for step, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(step = %truncate(step), error = %e, "failed to embed step, skipping");
                    continue;
                }
            };

            let hits = match search.search(&embedding, top_k, search_floor) {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(step = %truncate(step), error = %e, "search failed, skipping");
                    continue;
                }
            };

            let step_terms = domain_terms(step);
            let mut matches: Vec<TechniqueMatch> = hits
                .iter()
                .filter_map(|hit| {
                    let similarity = boosted_similarity(hit, &step_terms);
                    (similarity >= min_similarity).then(|| TechniqueMatch::from_hit(hit, similarity))
                })
                .collect();

            if matches.is_empty() {
                continue;
            }
            matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

            results.push(StepMatches {
                step: step.clone(),
                matches,
            });
        }

        info!(matched = results.len(), total = steps.len(), "matched attack steps");
        Ok(results)
    }

    fn index(&mut self) -> Result<&mut LoadedIndex> {
        if self.index.is_none() {
            let source = self
                .source
                .as_ref()
                .ok_or_else(|| TreewardError::Model("matcher has no graph source".into()))?;

            info!(model = %source.embeddings.model, "initializing technique graph");
            let mut embeddings = EmbeddingService::new(source.embeddings.clone());
            let graph = get_or_build(&source.store, &source.bundle, &mut embeddings, false)?;
            let search = VectorSearch::new(graph)?;
            self.index = Some(LoadedIndex { embeddings, search });
        }
        self.index
            .as_mut()
            .ok_or_else(|| TreewardError::Model("technique index unavailable".into()))
    }
}

fn boosted_similarity(hit: &MatchResult<'_>, step_terms: &BTreeSet<&'static str>) -> f32 {
    if step_terms.is_empty() {
        return hit.similarity;
    }
    let technique_terms = domain_terms(&hit.technique.search_text());
    let shared = step_terms.intersection(&technique_terms).count();
    hit.similarity * boost_factor(shared)
}

fn truncate(step: &str) -> &str {
    match step.char_indices().nth(50) {
        Some((i, _)) => &step[..i],
        None => step,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use chrono::Utc;
    use treeward_graph::EmbeddingModel;
    use treeward_shared::TechniqueNode;

    use super::*;

    /// Every step embeds to the x axis; techniques carry hand-picked vectors,
    /// so a technique's raw similarity is its x component.
    struct AxisModel;

    impl EmbeddingModel for AxisModel {
        fn dimension(&self) -> usize {
            2
        }
        fn encode(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    /// Fails whenever a text mentions "poison".
    struct PickyModel;

    impl EmbeddingModel for PickyModel {
        fn dimension(&self) -> usize {
            2
        }
        fn encode(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(TreewardError::Model("refused".into()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn service(model: fn() -> Box<dyn EmbeddingModel>) -> EmbeddingService {
        EmbeddingService::with_loader(
            EmbeddingConfig {
                model: "axis".into(),
                dimension: Some(2),
                ..Default::default()
            },
            Box::new(move |_: &EmbeddingConfig| -> Result<Box<dyn EmbeddingModel>> { Ok(model()) }),
        )
    }

    fn technique(id: &str, name: &str, description: &str, raw: f32) -> TechniqueNode {
        TechniqueNode {
            internal_id: format!("technique-{id}"),
            source_id: format!("attack-pattern--{id}"),
            name: name.into(),
            description: description.into(),
            external_ids: vec![id.into()],
            tactics: BTreeSet::from(["discovery".to_string()]),
            embedding: vec![raw, (1.0 - raw * raw).sqrt()],
            extra_metadata: BTreeMap::new(),
        }
    }

    fn graph(techniques: Vec<TechniqueNode>) -> TechniqueGraph {
        TechniqueGraph {
            techniques,
            embedding_model: "axis".into(),
            embedding_dim: 2,
            created_at: Utc::now(),
            source_version: "unknown".into(),
            extra_metadata: BTreeMap::new(),
        }
    }

    fn matcher(techniques: Vec<TechniqueNode>) -> TechniqueMatcher {
        TechniqueMatcher::with_index(
            service(|| Box::new(AxisModel)),
            graph(techniques),
            DEFAULT_MIN_SIMILARITY,
        )
        .expect("matcher")
    }

    #[test]
    fn boost_factor_is_capped() {
        assert_eq!(boost_factor(0), 1.0);
        assert!((boost_factor(2) - 1.2).abs() < 1e-6);
        assert_eq!(boost_factor(5), 1.5);
        assert_eq!(boost_factor(9), 1.5);
    }

    #[test]
    fn domain_terms_are_case_insensitive_substrings() {
        let terms = domain_terms("Attacker scans public S3 Buckets");
        assert_eq!(terms, BTreeSet::from(["bucket", "s3"]));
        assert!(domain_terms("phishing email").is_empty());
    }

    #[test]
    fn bucket_technique_is_boosted_above_raw_ranking() {
        let mut matcher = matcher(vec![
            technique(
                "T1595",
                "Active Scanning",
                "Adversaries may scan victim infrastructure.",
                0.9,
            ),
            technique(
                "T1530",
                "Data from Cloud Storage",
                "Adversaries may access data in an S3 bucket.",
                0.8,
            ),
        ]);

        let results = matcher
            .match_steps(&["attacker scans public S3 buckets".to_string()], 2)
            .expect("match");
        assert_eq!(results.len(), 1);

        let matches = &results[0].matches;
        assert_eq!(matches[0].technique_id, "T1530");
        assert!((matches[0].similarity - 0.96).abs() < 1e-4);
        assert_eq!(matches[0].confidence, Confidence::High);
        assert_eq!(matches[1].technique_id, "T1595");
        assert!((matches[1].similarity - 0.9).abs() < 1e-4);
    }

    #[test]
    fn no_shared_terms_leaves_similarity_unchanged() {
        let mut matcher = matcher(vec![technique(
            "T1566",
            "Phishing",
            "Adversaries may send phishing messages.",
            0.6,
        )]);
        let results = matcher
            .match_steps(&["send a phishing email".to_string()], 3)
            .expect("match");
        assert!((results[0].matches[0].similarity - 0.6).abs() < 1e-4);
        assert_eq!(results[0].matches[0].confidence, Confidence::Medium);
    }

    #[test]
    fn boost_rescues_result_below_threshold() {
        let mut matcher = matcher(vec![
            technique("T1530", "Data from Cloud Storage", "Read an S3 bucket.", 0.28),
            technique("T1110", "Brute Force", "Guess passwords.", 0.28),
        ]);
        let results = matcher
            .match_steps(&["list S3 bucket contents".to_string()], 5)
            .expect("match");

        let ids: Vec<_> = results[0].matches.iter().map(|m| m.technique_id.as_str()).collect();
        assert_eq!(ids, vec!["T1530"]);
        assert!(results[0].matches[0].similarity >= DEFAULT_MIN_SIMILARITY);
    }

    #[test]
    fn unmatched_and_failing_steps_are_omitted() {
        let mut matcher = TechniqueMatcher::with_index(
            service(|| Box::new(PickyModel)),
            graph(vec![technique("T1078", "Valid Accounts", "Use stolen credentials.", 0.5)]),
            DEFAULT_MIN_SIMILARITY,
        )
        .expect("matcher");

        let steps = vec![
            "poison the cache".to_string(),
            String::new(),
            "log in with stolen credentials".to_string(),
        ];
        let results = matcher.match_steps(&steps, 3).expect("match");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].step, "log in with stolen credentials");
        assert!(results.iter().all(|r| !r.matches.is_empty()));

        let mut strict = TechniqueMatcher::with_index(
            service(|| Box::new(AxisModel)),
            graph(vec![technique("T1078", "Valid Accounts", "", 0.1)]),
            DEFAULT_MIN_SIMILARITY,
        )
        .expect("matcher");
        assert!(strict.match_steps(&["anything".to_string()], 3).expect("match").is_empty());
    }

    #[test]
    fn with_index_rejects_foreign_graph() {
        let mut foreign = graph(vec![]);
        foreign.embedding_model = "other".into();
        assert!(TechniqueMatcher::with_index(service(|| Box::new(AxisModel)), foreign, 0.3).is_err());
    }

    #[test]
    fn lazily_builds_index_from_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::default();
        config.embeddings.model = "hashing-64".into();
        config.embeddings.dimension = Some(64);
        config.paths.graph_dir = dir.path().display().to_string();
        config.paths.bundle = "../../../fixtures/json/bundle.fixture.json".into();

        let mut matcher = TechniqueMatcher::new(&config);
        assert_eq!(matcher.model_name(), "hashing-64");
        assert_eq!(matcher.statistics().expect("stats").num_techniques, 2);
        assert!(dir.path().join("technique_graph_hashing-64.json").exists());
    }
}

//! In-memory cosine-similarity search over a technique graph.

use tracing::info;

use treeward_shared::{Confidence, Result, TechniqueGraph, TechniqueNode, TreewardError};

/// One search hit, borrowing the technique from the index.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult<'a> {
    pub technique: &'a TechniqueNode,
    pub similarity: f32,
    pub confidence: Confidence,
}

impl<'a> MatchResult<'a> {
    pub fn new(technique: &'a TechniqueNode, similarity: f32) -> Self {
        Self {
            technique,
            similarity,
            confidence: Confidence::from_similarity(similarity),
        }
    }
}

/// Summary numbers for a loaded index.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SearchStatistics {
    pub num_techniques: usize,
    pub embedding_dim: usize,
    pub model: String,
}

/// Owns a graph plus a dense row-major copy of its embeddings.
#[derive(Debug)]
pub struct VectorSearch {
    graph: TechniqueGraph,
    matrix: Vec<f32>,
    norms: Vec<f32>,
    dim: usize,
}

impl VectorSearch {
    /// Index `graph`. Fails if any node disagrees with the graph dimension.
    pub fn new(graph: TechniqueGraph) -> Result<Self> {
        if let Some(node) = graph.find_dimension_violation() {
            return Err(TreewardError::validation(format!(
                "technique {} has {} values, graph declares {}",
                node.internal_id,
                node.embedding.len(),
                graph.embedding_dim
            )));
        }

        let dim = graph.embedding_dim;
        let mut matrix = Vec::with_capacity(graph.len() * dim);
        let mut norms = Vec::with_capacity(graph.len());
        for node in &graph.techniques {
            matrix.extend_from_slice(&node.embedding);
            norms.push(l2_norm(&node.embedding));
        }

        info!(techniques = graph.len(), dim, "initialized vector search");
        Ok(Self {
            graph,
            matrix,
            norms,
            dim,
        })
    }

    pub fn graph(&self) -> &TechniqueGraph {
        &self.graph
    }

    /// Up to `top_k` techniques most similar to `query`, best first.
    ///
    /// Candidates are cut to `top_k` before `min_similarity` is applied, so
    /// fewer than `top_k` results may come back. Equal scores keep graph order.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<MatchResult<'_>>> {
        if query.is_empty() || self.graph.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dim {
            return Err(TreewardError::Model(format!(
                "query has {} values, index expects {}",
                query.len(),
                self.dim
            )));
        }

        let query_norm = l2_norm(query);
        let mut scored: Vec<(usize, f32)> = self
            .matrix
            .chunks_exact(self.dim)
            .zip(&self.norms)
            .enumerate()
            .map(|(i, (row, &norm))| {
                let denom = query_norm * norm;
                let sim = if denom > 0.0 { dot(query, row) / denom } else { 0.0 };
                (i, sim)
            })
            .collect();

        // sort_by is stable, so ties stay in node order
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .filter(|(_, sim)| *sim >= min_similarity)
            .map(|(i, sim)| MatchResult::new(&self.graph.techniques[i], sim))
            .collect())
    }

    /// Run [`search`](Self::search) independently for each query.
    pub fn search_batch(
        &self,
        queries: &[Vec<f32>],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<Vec<MatchResult<'_>>>> {
        queries
            .iter()
            .map(|q| self.search(q, top_k, min_similarity))
            .collect()
    }

    pub fn statistics(&self) -> SearchStatistics {
        SearchStatistics {
            num_techniques: self.graph.len(),
            embedding_dim: self.dim,
            model: self.graph.embedding_model.clone(),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn l2_norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

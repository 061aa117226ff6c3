//! Attack tree enrichment: best technique per attack step plus mitigations.

use tracing::{debug, info, warn};

use treeward_shared::{AttackTree, MappedTree, MappingReport, MappingSummary, Result, TtcMapping};

use crate::matcher::TechniqueMatcher;
use crate::mitigations::MitigationIndex;
use crate::steps::extract_attack_steps;

/// Reported by [`map_trees`] around each tree.
#[derive(Debug, Clone, Copy)]
pub enum TreeProgress<'a> {
    Started { index: usize, tree: &'a AttackTree },
    Mapped { index: usize, tree: &'a MappedTree },
}

/// Map every attack step of one tree to its best technique.
pub fn map_tree(
    matcher: &mut TechniqueMatcher,
    mitigations: &MitigationIndex,
    tree: &AttackTree,
    top_k: usize,
) -> Result<MappedTree> {
    let steps = extract_attack_steps(&tree.mermaid_code);
    if steps.is_empty() {
        warn!(threat_id = %tree.threat_id, "no attack steps found in tree");
        return Ok(MappedTree {
            tree: tree.clone(),
            ttc_mappings: Vec::new(),
        });
    }

    let ttc_mappings: Vec<TtcMapping> = matcher
        .match_steps(&steps, top_k)?
        .into_iter()
        .filter_map(|step| {
            let best = step.matches.into_iter().next()?;
            Some(TtcMapping {
                reasoning: format!("Embedding similarity: {:.3}", best.similarity),
                mitigations: mitigations.get(&best.technique_id).to_vec(),
                attack_step: step.step,
                technique_id: best.technique_id,
                technique_name: best.name,
                similarity: best.similarity,
                confidence: best.confidence,
                tactics: best.tactics,
            })
        })
        .collect();

    debug!(threat_id = %tree.threat_id, steps = steps.len(), mapped = ttc_mappings.len(), "mapped tree");
    Ok(MappedTree {
        tree: tree.clone(),
        ttc_mappings,
    })
}

/// Aggregate counts over mapped trees. A mapping is successful when its
/// similarity reaches `threshold`.
pub fn summarize(trees: &[MappedTree], threshold: f32, model: &str) -> MappingSummary {
    let mappings = trees.iter().flat_map(|t| &t.ttc_mappings);
    MappingSummary {
        total_mappings: mappings.clone().count(),
        successful_mappings: mappings.filter(|m| m.similarity >= threshold).count(),
        threshold_used: threshold,
        model: model.to_string(),
    }
}

/// Map all trees with `top_k` candidates per step and summarize the result.
pub fn map_trees(
    matcher: &mut TechniqueMatcher,
    mitigations: &MitigationIndex,
    trees: &[AttackTree],
    top_k: usize,
    mut on_progress: impl FnMut(TreeProgress<'_>),
) -> Result<MappingReport> {
    let mut mapped = Vec::with_capacity(trees.len());
    for (index, tree) in trees.iter().enumerate() {
        on_progress(TreeProgress::Started { index, tree });
        let result = map_tree(matcher, mitigations, tree, top_k)?;
        on_progress(TreeProgress::Mapped {
            index,
            tree: &result,
        });
        mapped.push(result);
    }

    let summary = summarize(&mapped, matcher.min_similarity(), matcher.model_name());
    info!(
        trees = mapped.len(),
        total = summary.total_mappings,
        successful = summary.successful_mappings,
        "technique mapping complete"
    );
    Ok(MappingReport {
        trees: mapped,
        summary,
    })
}

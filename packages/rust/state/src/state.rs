//! Workflow stages and the persisted run state.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use treeward_shared::{
    AttackTree, ContextReport, ExtractionReport, MappingReport, Result, RunId, SetupReport,
    SummaryReport, TreewardError,
};

// ---------------------------------------------------------------------------
// WorkflowStage
// ---------------------------------------------------------------------------

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Setup,
    ContextAnalysis,
    Extraction,
    TreeGeneration,
    Mapping,
    Summary,
    Complete,
}

impl WorkflowStage {
    pub const ORDER: [WorkflowStage; 7] = [
        Self::Setup,
        Self::ContextAnalysis,
        Self::Extraction,
        Self::TreeGeneration,
        Self::Mapping,
        Self::Summary,
        Self::Complete,
    ];

    /// Position in [`ORDER`](Self::ORDER).
    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// Stages a run may be in when it enters `self`.
    ///
    /// Summary accepts tree generation directly so mapping can be disabled.
    pub fn predecessors(self) -> &'static [WorkflowStage] {
        match self {
            Self::Setup => &[],
            Self::ContextAnalysis => &[Self::Setup],
            Self::Extraction => &[Self::ContextAnalysis],
            Self::TreeGeneration => &[Self::Extraction],
            Self::Mapping => &[Self::TreeGeneration],
            Self::Summary => &[Self::Mapping, Self::TreeGeneration],
            Self::Complete => &[Self::Summary],
        }
    }

    /// The stage whose completion flag must be set before `self` can have run.
    fn prerequisite(self) -> Option<WorkflowStage> {
        match self {
            Self::Setup => None,
            Self::ContextAnalysis => Some(Self::Setup),
            Self::Extraction => Some(Self::ContextAnalysis),
            Self::TreeGeneration => Some(Self::Extraction),
            Self::Mapping | Self::Summary => Some(Self::TreeGeneration),
            Self::Complete => Some(Self::Summary),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::ContextAnalysis => "context_analysis",
            Self::Extraction => "extraction",
            Self::TreeGeneration => "tree_generation",
            Self::Mapping => "mapping",
            Self::Summary => "summary",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStage {
    type Err = TreewardError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ORDER
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| TreewardError::validation(format!("unknown workflow stage: {s}")))
    }
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// Everything a run has produced so far. Persisted after every completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: RunId,
    pub current_stage: WorkflowStage,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,

    pub project_path: PathBuf,
    /// Language model the stage agents use.
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_model_path: Option<PathBuf>,

    #[serde(default)]
    pub setup_complete: bool,
    #[serde(default)]
    pub context_analysis_complete: bool,
    #[serde(default)]
    pub extraction_complete: bool,
    #[serde(default)]
    pub tree_generation_complete: bool,
    #[serde(default)]
    pub mapping_complete: bool,
    #[serde(default)]
    pub summary_complete: bool,

    #[serde(default)]
    pub setup_result: Option<SetupReport>,
    #[serde(default)]
    pub context_result: Option<ContextReport>,
    #[serde(default)]
    pub extraction_result: Option<ExtractionReport>,
    #[serde(default)]
    pub attack_trees: Vec<AttackTree>,
    #[serde(default)]
    pub mapping_result: Option<MappingReport>,
    #[serde(default)]
    pub summary_result: Option<SummaryReport>,

    /// Append-only failure log.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl WorkflowState {
    /// Fresh state at [`WorkflowStage::Setup`] with nothing completed.
    pub fn new(
        project_path: impl Into<PathBuf>,
        model: impl Into<String>,
        threat_model_path: Option<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            current_stage: WorkflowStage::Setup,
            started_at: now,
            last_updated: now,
            project_path: project_path.into(),
            model: model.into(),
            threat_model_path,
            setup_complete: false,
            context_analysis_complete: false,
            extraction_complete: false,
            tree_generation_complete: false,
            mapping_complete: false,
            summary_complete: false,
            setup_result: None,
            context_result: None,
            extraction_result: None,
            attack_trees: Vec::new(),
            mapping_result: None,
            summary_result: None,
            errors: Vec::new(),
        }
    }

    /// True when the run is at `stage` or at one of its predecessors.
    pub fn can_transition_to(&self, stage: WorkflowStage) -> bool {
        self.current_stage == stage || stage.predecessors().contains(&self.current_stage)
    }

    pub fn advance_to(&mut self, stage: WorkflowStage) -> Result<()> {
        if !self.can_transition_to(stage) {
            return Err(TreewardError::InvalidTransition {
                from: self.current_stage.to_string(),
                to: stage.to_string(),
            });
        }
        self.current_stage = stage;
        self.touch();
        Ok(())
    }

    /// Completion flag for `stage`. `complete` has no flag and reads as
    /// whether the run has reached it.
    pub fn is_stage_complete(&self, stage: WorkflowStage) -> bool {
        match stage {
            WorkflowStage::Setup => self.setup_complete,
            WorkflowStage::ContextAnalysis => self.context_analysis_complete,
            WorkflowStage::Extraction => self.extraction_complete,
            WorkflowStage::TreeGeneration => self.tree_generation_complete,
            WorkflowStage::Mapping => self.mapping_complete,
            WorkflowStage::Summary => self.summary_complete,
            WorkflowStage::Complete => self.current_stage == WorkflowStage::Complete,
        }
    }

    /// Set the completion flag for `stage`.
    pub fn mark_complete(&mut self, stage: WorkflowStage) {
        let flag = match stage {
            WorkflowStage::Setup => &mut self.setup_complete,
            WorkflowStage::ContextAnalysis => &mut self.context_analysis_complete,
            WorkflowStage::Extraction => &mut self.extraction_complete,
            WorkflowStage::TreeGeneration => &mut self.tree_generation_complete,
            WorkflowStage::Mapping => &mut self.mapping_complete,
            WorkflowStage::Summary => &mut self.summary_complete,
            WorkflowStage::Complete => return,
        };
        *flag = true;
        self.touch();
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.touch();
    }

    pub fn is_valid_for_resume(&self) -> bool {
        self.resume_check().is_ok()
    }

    /// Explain why this state cannot be resumed, if it cannot.
    pub fn resume_check(&self) -> std::result::Result<(), String> {
        let current = self.current_stage;
        if current == WorkflowStage::Complete {
            return Err("workflow already complete".into());
        }

        // every stage at or before the current one needs its prerequisite done
        for stage in WorkflowStage::ORDER {
            if stage.ordinal() > current.ordinal() {
                break;
            }
            if let Some(required) = stage.prerequisite() {
                if !self.is_stage_complete(required) {
                    return Err(format!("{required} incomplete for stage {current}"));
                }
            }
        }

        // completion flags must not run ahead of the current stage or skip a prerequisite
        for stage in WorkflowStage::ORDER {
            if stage == WorkflowStage::Complete || !self.is_stage_complete(stage) {
                continue;
            }
            if stage.ordinal() > current.ordinal() {
                return Err(format!("{stage} marked complete while at stage {current}"));
            }
            if let Some(required) = stage.prerequisite() {
                if !self.is_stage_complete(required) {
                    return Err(format!("{stage} marked complete but {required} is not"));
                }
            }
        }

        Ok(())
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> WorkflowState {
        WorkflowState::new("/tmp/project", "anthropic.claude-sonnet", None)
    }

    #[test]
    fn stage_serialization_and_parsing() {
        assert_eq!(
            serde_json::to_string(&WorkflowStage::TreeGeneration).expect("serialize"),
            r#""tree_generation""#
        );
        for stage in WorkflowStage::ORDER {
            assert_eq!(stage.as_str().parse::<WorkflowStage>().expect("parse"), stage);
        }
        assert!("ttc_enrichment".parse::<WorkflowStage>().is_err());
    }

    #[test]
    fn transitions_follow_order_and_self_only() {
        let mut state = fresh();
        for (i, from) in WorkflowStage::ORDER.iter().enumerate() {
            state.current_stage = *from;
            for (j, to) in WorkflowStage::ORDER.iter().enumerate() {
                let expected = i == j
                    || j == i + 1
                    || (*from == WorkflowStage::TreeGeneration && *to == WorkflowStage::Summary);
                assert_eq!(
                    state.can_transition_to(*to),
                    expected,
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn advance_to_extraction_from_fresh_fails() {
        let mut state = fresh();
        let err = state.advance_to(WorkflowStage::Extraction).unwrap_err();
        assert!(matches!(err, TreewardError::InvalidTransition { .. }));
        assert_eq!(err.to_string(), "cannot transition from setup to extraction");
        assert_eq!(state.current_stage, WorkflowStage::Setup);
    }

    #[test]
    fn advance_updates_timestamp() {
        let mut state = fresh();
        let before = state.last_updated;
        state.advance_to(WorkflowStage::ContextAnalysis).expect("advance");
        assert_eq!(state.current_stage, WorkflowStage::ContextAnalysis);
        assert!(state.last_updated >= before);
    }

    #[test]
    fn fresh_state_is_resumable() {
        assert!(fresh().is_valid_for_resume());
    }

    #[test]
    fn complete_state_is_not_resumable() {
        let mut state = fresh();
        state.current_stage = WorkflowStage::Complete;
        assert_eq!(state.resume_check().unwrap_err(), "workflow already complete");
    }

    #[test]
    fn missing_prerequisite_flag_is_not_resumable() {
        let mut state = fresh();
        state.current_stage = WorkflowStage::Extraction;
        state.setup_complete = true;
        assert!(!state.is_valid_for_resume());

        state.context_analysis_complete = true;
        assert!(state.is_valid_for_resume());
    }

    #[test]
    fn non_monotone_flags_are_not_resumable() {
        let mut state = fresh();
        state.current_stage = WorkflowStage::TreeGeneration;
        state.setup_complete = true;
        state.context_analysis_complete = true;
        state.extraction_complete = true;
        state.summary_complete = true;
        assert!(!state.is_valid_for_resume());

        let mut state = fresh();
        state.current_stage = WorkflowStage::Extraction;
        state.setup_complete = true;
        state.context_analysis_complete = true;
        state.extraction_complete = true;
        state.tree_generation_complete = true;
        assert!(!state.is_valid_for_resume());
    }

    #[test]
    fn summary_after_skipped_mapping_is_resumable() {
        let mut state = fresh();
        state.current_stage = WorkflowStage::Summary;
        state.setup_complete = true;
        state.context_analysis_complete = true;
        state.extraction_complete = true;
        state.tree_generation_complete = true;
        assert!(state.is_valid_for_resume());
    }

    #[test]
    fn mark_complete_sets_flags() {
        let mut state = fresh();
        state.mark_complete(WorkflowStage::Setup);
        state.mark_complete(WorkflowStage::Complete);
        assert!(state.is_stage_complete(WorkflowStage::Setup));
        assert!(!state.is_stage_complete(WorkflowStage::Complete));
    }

    #[test]
    fn state_roundtrip_preserves_everything() {
        let mut state = fresh();
        state.mark_complete(WorkflowStage::Setup);
        state.setup_result = Some(SetupReport {
            project_path: "/tmp/project".into(),
            model: "anthropic.claude-sonnet".into(),
            notes: Default::default(),
        });
        state.record_error("extraction failed: timeout");

        let json = serde_json::to_string_pretty(&state).expect("serialize");
        assert!(json.contains(r#""current_stage": "setup""#));
        let parsed: WorkflowState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, state);
    }
}

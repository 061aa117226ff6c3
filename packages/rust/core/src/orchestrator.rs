//! End-to-end threat-modeling run: setup → context analysis → extraction →
//! tree generation → technique mapping → summary.
//!
//! Every completed stage is checkpointed, so a failed or interrupted run can be
//! resumed without repeating finished work.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use treeward_mapping::{MitigationIndex, TechniqueMatcher, TreeProgress};
use treeward_shared::{
    AppConfig, AttackTree, ExtractionReport, MappingReport, MappingSummary, MatchingConfig,
    Result, RunId, SetupReport, TreewardError,
};
use treeward_state::{DEFAULT_CHECKPOINT, StateManager, WorkflowStage, WorkflowState};

use crate::agents::StageAgents;
use crate::progress::{ProgressEvent, ProgressEventType, ProgressSink, SilentProgress};

/// Application name reported when extraction did not name one.
const UNKNOWN_APP: &str = "unknown_app";

/// Inputs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Project directory to analyze.
    pub project_path: PathBuf,
    /// Language model the stage agents should use.
    pub model: String,
    /// Existing threat model to extract threats from.
    pub threat_model_path: Option<PathBuf>,
    /// Where attack trees and reports go. Defaults to `<project>/treeward/attack_trees`.
    pub output_dir: Option<PathBuf>,
    /// Continue from the latest checkpoint instead of starting over.
    pub resume: bool,
}

impl RunOptions {
    pub fn new(project_path: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            model: model.into(),
            threat_model_path: None,
            output_dir: None,
            resume: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

/// What a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub run_id: RunId,
    /// Stage reached: `complete` on success, the failing stage otherwise.
    pub stage: WorkflowStage,
    pub application_name: String,
    pub output_dir: PathBuf,
    pub output_files: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<MappingSummary>,
    pub errors: Vec<String>,
}

impl RunOutcome {
    fn from_state(state: &WorkflowState, status: RunStatus, output_dir: PathBuf) -> Self {
        Self {
            status,
            run_id: state.run_id.clone(),
            stage: state.current_stage,
            application_name: state
                .extraction_result
                .as_ref()
                .and_then(|e| e.application_name.clone())
                .unwrap_or_else(|| UNKNOWN_APP.to_string()),
            output_dir,
            output_files: state
                .summary_result
                .as_ref()
                .map(|s| s.output_files.clone())
                .unwrap_or_default(),
            mapping: state.mapping_result.as_ref().map(|m| m.summary.clone()),
            errors: state.errors.clone(),
        }
    }
}

/// Technique matcher plus the mitigation index, loaded on first use.
struct MappingStage {
    matcher: TechniqueMatcher,
    mitigations: Option<MitigationIndex>,
    bundle: Option<PathBuf>,
}

/// Drives one run through the workflow stages.
pub struct Orchestrator<A: StageAgents> {
    options: RunOptions,
    agents: A,
    states: StateManager,
    mapping: Option<MappingStage>,
    /// Candidate techniques per attack step.
    top_k: usize,
    progress: Box<dyn ProgressSink>,
}

impl<A: StageAgents> Orchestrator<A> {
    /// Orchestrator without technique mapping and with silent progress.
    pub fn new(options: RunOptions, agents: A, states: StateManager) -> Self {
        Self {
            options,
            agents,
            states,
            mapping: None,
            top_k: MatchingConfig::default().top_k,
            progress: Box::new(SilentProgress),
        }
    }

    /// Orchestrator wired from the app config: checkpoints under
    /// `paths.state_dir`, mapping enabled per `matching.enabled` with
    /// `matching.top_k` candidates per step.
    pub fn from_config(config: &AppConfig, options: RunOptions, agents: A) -> Result<Self> {
        let states = StateManager::new(config.paths.state_dir())?;
        let mut orchestrator =
            Self::new(options, agents, states).with_top_k(config.matching.top_k);
        if config.matching.enabled {
            orchestrator.mapping = Some(MappingStage {
                matcher: TechniqueMatcher::new(config),
                mitigations: None,
                bundle: Some(config.paths.bundle()),
            });
        }
        Ok(orchestrator)
    }

    pub fn with_mapping(mut self, matcher: TechniqueMatcher, mitigations: MitigationIndex) -> Self {
        self.mapping = Some(MappingStage {
            matcher,
            mitigations: Some(mitigations),
            bundle: None,
        });
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn without_mapping(mut self) -> Self {
        self.mapping = None;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn agents(&self) -> &A {
        &self.agents
    }

    pub fn output_dir(&self) -> PathBuf {
        self.options.output_dir.clone().unwrap_or_else(|| {
            self.options
                .project_path
                .join("treeward")
                .join("attack_trees")
        })
    }

    /// Run every stage that is not complete yet.
    ///
    /// A stage failure is recorded in the outcome (no checkpoint is written for
    /// the failed stage). Invalid transitions and unresumable checkpoints are
    /// returned as errors.
    #[instrument(skip_all, fields(project = %self.options.project_path.display(), resume = self.options.resume))]
    pub fn execute_workflow(&mut self) -> Result<RunOutcome> {
        let mut state = self.initialize_state()?;
        let output_dir = self.output_dir();
        info!(run_id = %state.run_id, stage = %state.current_stage, "starting workflow");

        match self.run_stages(&mut state, &output_dir) {
            Ok(()) => {
                info!(run_id = %state.run_id, output_dir = %output_dir.display(), "workflow complete");
                Ok(RunOutcome::from_state(&state, RunStatus::Success, output_dir))
            }
            Err(e) if e.is_invariant_violation() => {
                error!(stage = %state.current_stage, error = %e, "workflow invariant violated");
                Err(e)
            }
            Err(e) => {
                let stage = state.current_stage;
                error!(%stage, error = %e, "stage failed");
                let message = format!("{stage}: {e}");
                state.record_error(message.clone());
                self.progress.emit(&event(
                    ProgressEventType::Error,
                    stage,
                    band(stage).0,
                    message,
                ));
                Ok(RunOutcome::from_state(&state, RunStatus::Failed, output_dir))
            }
        }
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    fn fresh_state(&self) -> WorkflowState {
        WorkflowState::new(
            self.options.project_path.clone(),
            self.options.model.clone(),
            self.options.threat_model_path.clone(),
        )
    }

    fn initialize_state(&self) -> Result<WorkflowState> {
        let existing = match self.states.load_checkpoint(DEFAULT_CHECKPOINT) {
            Ok(existing) => existing,
            Err(e @ TreewardError::Corrupt { .. }) => {
                if self.options.resume {
                    return Err(TreewardError::InvalidResume {
                        reason: e.to_string(),
                    });
                }
                warn!(error = %e, "replacing unreadable checkpoint");
                self.archive_latest();
                return Ok(self.fresh_state());
            }
            Err(e) => return Err(e),
        };

        match existing {
            Some(state) if self.options.resume => {
                state
                    .resume_check()
                    .map_err(|reason| TreewardError::InvalidResume { reason })?;
                if !same_project(&state.project_path, &self.options.project_path) {
                    return Err(TreewardError::InvalidResume {
                        reason: format!(
                            "checkpoint belongs to project {}",
                            state.project_path.display()
                        ),
                    });
                }
                info!(run_id = %state.run_id, stage = %state.current_stage, "resuming workflow");
                Ok(state)
            }
            Some(_) => {
                self.archive_latest();
                Ok(self.fresh_state())
            }
            None => {
                if self.options.resume {
                    info!("no checkpoint to resume, starting fresh");
                }
                Ok(self.fresh_state())
            }
        }
    }

    fn archive_latest(&self) {
        if let Err(e) = self.states.archive_checkpoint(DEFAULT_CHECKPOINT) {
            warn!(error = %e, "failed to archive previous checkpoint");
        }
    }

    /// Enter `stage` and announce it.
    fn begin(&self, state: &mut WorkflowState, stage: WorkflowStage, message: &str) -> Result<()> {
        state.advance_to(stage)?;
        info!(%stage, "stage started");
        self.progress
            .emit(&event(ProgressEventType::StageStart, stage, band(stage).0, message));
        Ok(())
    }

    /// Mark `stage` complete and checkpoint.
    fn finish(&self, state: &mut WorkflowState, stage: WorkflowStage, message: &str) -> Result<()> {
        state.mark_complete(stage);
        self.states.save_checkpoint(state, DEFAULT_CHECKPOINT)?;
        info!(%stage, "stage complete");
        self.progress
            .emit(&event(ProgressEventType::StageComplete, stage, band(stage).1, message));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    fn run_stages(&mut self, state: &mut WorkflowState, output_dir: &Path) -> Result<()> {
        let empty = ExtractionReport::default();

        if !state.setup_complete {
            self.begin(state, WorkflowStage::Setup, "Validating project")?;
            state.setup_result = Some(validate_project(state)?);
            self.finish(state, WorkflowStage::Setup, "Project validated")?;
        }

        if !state.context_analysis_complete {
            self.begin(state, WorkflowStage::ContextAnalysis, "Analyzing project context")?;
            let report = self.agents.analyze_context(&state.project_path)?;
            debug!(categories = report.files.len(), "context analyzed");
            state.context_result = Some(report);
            self.finish(state, WorkflowStage::ContextAnalysis, "Context analyzed")?;
        }

        if !state.extraction_complete {
            self.begin(state, WorkflowStage::Extraction, "Extracting threats")?;
            let context = state.context_result.clone().unwrap_or_default();
            let report = self.agents.extract(
                &state.project_path,
                &context,
                state.threat_model_path.as_deref(),
            )?;
            let message = format!("Extracted {} threats", report.threat_statements.len());
            state.extraction_result = Some(report);
            self.finish(state, WorkflowStage::Extraction, &message)?;
        }

        if !state.tree_generation_complete {
            self.begin(state, WorkflowStage::TreeGeneration, "Generating attack trees")?;
            std::fs::create_dir_all(output_dir).map_err(|e| TreewardError::io(output_dir, e))?;
            let extraction = state.extraction_result.as_ref().unwrap_or(&empty);
            let trees = self.agents.generate_trees(extraction, output_dir)?;
            let message = format!("Generated {} attack trees", trees.len());
            state.attack_trees = trees;
            self.finish(state, WorkflowStage::TreeGeneration, &message)?;
        }

        if self.mapping.is_none() {
            info!("technique mapping disabled, skipping");
        } else if !state.mapping_complete {
            self.begin(state, WorkflowStage::Mapping, "Mapping attack steps to techniques")?;
            let report = self.map_trees(&state.attack_trees)?;
            let message = format!(
                "Mapped {} attack steps",
                report.summary.total_mappings
            );
            state.mapping_result = Some(report);
            self.finish(state, WorkflowStage::Mapping, &message)?;
        }

        self.begin(state, WorkflowStage::Summary, "Writing summary")?;
        let extraction = state.extraction_result.as_ref().unwrap_or(&empty);
        let summary = self.agents.summarize(
            extraction,
            &state.attack_trees,
            state.mapping_result.as_ref(),
            output_dir,
        )?;
        state.summary_result = Some(summary);
        state.mark_complete(WorkflowStage::Summary);
        state.advance_to(WorkflowStage::Complete)?;
        self.states.save_checkpoint(state, DEFAULT_CHECKPOINT)?;
        self.progress.emit(&event(
            ProgressEventType::StageComplete,
            WorkflowStage::Complete,
            100.0,
            "Workflow complete",
        ));

        self.retire_checkpoint();
        Ok(())
    }

    /// Map each tree, reporting per-threat progress.
    fn map_trees(&mut self, trees: &[AttackTree]) -> Result<MappingReport> {
        let Some(MappingStage {
            matcher,
            mitigations,
            bundle,
        }) = self.mapping.as_mut()
        else {
            return Ok(MappingReport::default());
        };
        let mitigations = mitigations.get_or_insert_with(|| load_mitigations(bundle.as_deref()));

        let progress = &self.progress;
        let (start, end) = band(WorkflowStage::Mapping);
        let step = (end - start) / trees.len().max(1) as f32;

        treeward_mapping::map_trees(matcher, mitigations, trees, self.top_k, |update| match update {
            TreeProgress::Started { index, tree } => progress.emit(&event(
                ProgressEventType::ThreatStart,
                WorkflowStage::Mapping,
                start + step * index as f32,
                format!("Mapping {}", tree.threat_id),
            )),
            TreeProgress::Mapped { index, tree } => progress.emit(
                &event(
                    ProgressEventType::ThreatComplete,
                    WorkflowStage::Mapping,
                    start + step * (index + 1) as f32,
                    format!("Mapped {}", tree.tree.threat_id),
                )
                .with_details(serde_json::json!({
                    "threat_id": tree.tree.threat_id,
                    "mappings": tree.ttc_mappings.len(),
                })),
            ),
        })
    }

    /// Archive the finished checkpoint and drop completed runs from the state dir.
    fn retire_checkpoint(&self) {
        self.archive_latest();
        match self.states.cleanup_completed_states() {
            Ok(removed) => debug!(removed, "completed checkpoints removed"),
            Err(e) => warn!(error = %e, "checkpoint cleanup failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Progress range covered by each stage.
fn band(stage: WorkflowStage) -> (f32, f32) {
    match stage {
        WorkflowStage::Setup => (0.0, 10.0),
        WorkflowStage::ContextAnalysis => (10.0, 20.0),
        WorkflowStage::Extraction => (20.0, 40.0),
        WorkflowStage::TreeGeneration => (40.0, 70.0),
        WorkflowStage::Mapping => (70.0, 85.0),
        WorkflowStage::Summary => (85.0, 100.0),
        WorkflowStage::Complete => (100.0, 100.0),
    }
}

fn event(
    kind: ProgressEventType,
    stage: WorkflowStage,
    percentage: f32,
    message: impl Into<String>,
) -> ProgressEvent {
    ProgressEvent::new(kind, stage.as_str(), percentage, message)
}

fn validate_project(state: &WorkflowState) -> Result<SetupReport> {
    let project = &state.project_path;
    if !project.is_dir() {
        return Err(TreewardError::validation(format!(
            "project directory not found: {}",
            project.display()
        )));
    }
    let project_path = project
        .canonicalize()
        .map_err(|e| TreewardError::io(project, e))?;

    let mut notes = BTreeMap::new();
    if let Some(threat_model) = &state.threat_model_path {
        if !threat_model.is_file() {
            return Err(TreewardError::validation(format!(
                "threat model not found: {}",
                threat_model.display()
            )));
        }
        notes.insert("threat_model".to_string(), threat_model.display().to_string());
    }

    Ok(SetupReport {
        project_path,
        model: state.model.clone(),
        notes,
    })
}

fn load_mitigations(bundle: Option<&Path>) -> MitigationIndex {
    let Some(bundle) = bundle else {
        return MitigationIndex::default();
    };
    match MitigationIndex::load(bundle) {
        Ok(index) => index,
        Err(e) => {
            warn!(bundle = %bundle.display(), error = %e, "mitigations unavailable");
            MitigationIndex::default()
        }
    }
}

fn same_project(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

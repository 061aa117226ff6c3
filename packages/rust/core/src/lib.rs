//! Workflow engine for Treeward.
//!
//! Ties the stage agents, technique mapping and checkpointing together into a
//! resumable threat-modeling run.

pub mod agents;
pub mod orchestrator;
pub mod progress;

pub use agents::{BridgeAgents, BridgeResult, StageAgents, TokenUsage};
pub use orchestrator::{Orchestrator, RunOptions, RunOutcome, RunStatus};
pub use progress::{
    LineEmitter, ProgressEvent, ProgressEventType, ProgressSink, SilentProgress,
};

//! Resumable workflow state for Treeward.
//!
//! [`WorkflowState`] is the stage machine; [`StateManager`] persists it as
//! named JSON checkpoints so an interrupted run can pick up where it stopped.

pub mod manager;
pub mod state;

pub use manager::{DEFAULT_CHECKPOINT, StateManager};
pub use state::{WorkflowStage, WorkflowState};

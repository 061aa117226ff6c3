//! Checkpoint persistence for workflow runs.
//!
//! One JSON file per checkpoint name under the state directory, plus an
//! `archive/` subdirectory of timestamped copies.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Local;
use serde::Deserialize;
use tracing::{debug, info, warn};

use treeward_shared::{Result, TreewardError};

use crate::state::{WorkflowStage, WorkflowState};

/// Checkpoint written by the orchestrator.
pub const DEFAULT_CHECKPOINT: &str = "latest";

const ARCHIVE_DIR: &str = "archive";

/// Just enough of a checkpoint to tell whether its run finished.
#[derive(Deserialize)]
struct StageHeader {
    current_stage: WorkflowStage,
}

/// Saves, loads and prunes workflow checkpoints.
#[derive(Debug, Clone)]
pub struct StateManager {
    state_dir: PathBuf,
}

impl StateManager {
    /// Open the state directory, creating it if needed.
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir).map_err(|e| TreewardError::io(&state_dir, e))?;
        Ok(Self { state_dir })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Path of the checkpoint called `name`.
    pub fn checkpoint_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.state_dir.join(format!("{name}.json")))
    }

    /// Write `state` under `name`, replacing any previous checkpoint atomically.
    pub fn save_checkpoint(&self, state: &WorkflowState, name: &str) -> Result<()> {
        let path = self.checkpoint_path(name)?;
        let temp = self.state_dir.join(format!(".{name}.json.tmp"));

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| TreewardError::validation(format!("serialize checkpoint: {e}")))?;
        std::fs::write(&temp, json).map_err(|e| TreewardError::io(&temp, e))?;
        std::fs::rename(&temp, &path).map_err(|e| TreewardError::io(&path, e))?;

        debug!(checkpoint = name, stage = %state.current_stage, "saved checkpoint");
        Ok(())
    }

    /// Load the checkpoint called `name`, or `None` if there is none.
    pub fn load_checkpoint(&self, name: &str) -> Result<Option<WorkflowState>> {
        let path = self.checkpoint_path(name)?;
        if !path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path).map_err(|e| TreewardError::io(&path, e))?;
        let state = serde_json::from_str(&content)
            .map_err(|e| TreewardError::corrupt(&path, e.to_string()))?;
        Ok(Some(state))
    }

    /// Checkpoint names, sorted.
    pub fn list_checkpoints(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .checkpoint_files()?
            .iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Remove the checkpoint called `name`. Returns whether it existed.
    pub fn delete_checkpoint(&self, name: &str) -> Result<bool> {
        let path = self.checkpoint_path(name)?;
        if !path.is_file() {
            return Ok(false);
        }
        std::fs::remove_file(&path).map_err(|e| TreewardError::io(&path, e))?;
        info!(checkpoint = name, "deleted checkpoint");
        Ok(true)
    }

    /// Copy the checkpoint into `archive/<name>_<timestamp>.json`, keeping the
    /// original. Returns the archive path, or `None` if there was nothing to archive.
    pub fn archive_checkpoint(&self, name: &str) -> Result<Option<PathBuf>> {
        let source = self.checkpoint_path(name)?;
        if !source.is_file() {
            return Ok(None);
        }

        let archive_dir = self.state_dir.join(ARCHIVE_DIR);
        std::fs::create_dir_all(&archive_dir).map_err(|e| TreewardError::io(&archive_dir, e))?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut target = archive_dir.join(format!("{name}_{stamp}.json"));
        let mut suffix = 1;
        while target.exists() {
            target = archive_dir.join(format!("{name}_{stamp}_{suffix}.json"));
            suffix += 1;
        }

        std::fs::copy(&source, &target).map_err(|e| TreewardError::io(&target, e))?;
        info!(checkpoint = name, archive = %target.display(), "archived checkpoint");
        Ok(Some(target))
    }

    /// Delete checkpoints not modified in the last `days` days.
    pub fn cleanup_old_checkpoints(&self, days: u64) -> Result<usize> {
        let max_age = Duration::from_secs(days.saturating_mul(24 * 60 * 60));
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        for path in self.checkpoint_files()? {
            let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot stat checkpoint, skipping");
                    continue;
                }
            };
            if modified < cutoff {
                std::fs::remove_file(&path).map_err(|e| TreewardError::io(&path, e))?;
                removed += 1;
            }
        }

        info!(removed, days, "cleaned up old checkpoints");
        Ok(removed)
    }

    /// Delete checkpoints whose run reached `complete`. Unreadable files are left alone.
    pub fn cleanup_completed_states(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.checkpoint_files()? {
            let header: StageHeader = match std::fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str(&c).ok())
            {
                Some(h) => h,
                None => {
                    debug!(path = %path.display(), "unreadable checkpoint, skipping");
                    continue;
                }
            };
            if header.current_stage == WorkflowStage::Complete {
                std::fs::remove_file(&path).map_err(|e| TreewardError::io(&path, e))?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "removed completed checkpoints");
        }
        Ok(removed)
    }

    /// `*.json` files directly in the state dir, excluding temp files.
    fn checkpoint_files(&self) -> Result<Vec<PathBuf>> {
        let entries =
            std::fs::read_dir(&self.state_dir).map_err(|e| TreewardError::io(&self.state_dir, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TreewardError::io(&self.state_dir, e))?;
            let path = entry.path();
            let hidden = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if path.is_file() && !hidden && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

/// Checkpoint names are plain file stems: ASCII letters, digits, `-`, `_`.
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TreewardError::validation(format!("invalid checkpoint name: {name:?}")))
    }
}

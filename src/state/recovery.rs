//! Phase checkpoints and crash recovery.
//!
//! Each checkpoint is a full copy of the state document named by its
//! ISO-8601 creation instant (colons replaced with hyphens so the name is
//! filesystem-safe and sorts correctly). Retention is a ring by
//! modification time.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::errors::{FlowError, Result};
use crate::paths;
use crate::state::model::OrchestrationState;
use crate::state::store::field_from_serde_message;

pub const DEFAULT_CHECKPOINTS_KEPT: usize = 10;

#[derive(Debug, Clone)]
pub struct RecoveryManager {
    checkpoints_dir: PathBuf,
}

impl RecoveryManager {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            checkpoints_dir: paths::checkpoints_dir(repo_root),
        }
    }

    pub fn checkpoints_dir(&self) -> &Path {
        &self.checkpoints_dir
    }

    /// Snapshot the state into a timestamped checkpoint file.
    pub fn checkpoint(&self, state: &OrchestrationState) -> Result<PathBuf> {
        fs::create_dir_all(&self.checkpoints_dir)?;
        let name = format!("{}.yaml", Utc::now().format("%Y-%m-%dT%H-%M-%SZ"));
        let path = self.checkpoints_dir.join(name);
        fs::write(&path, serde_yaml::to_string(state)?)?;
        Ok(path)
    }

    /// All checkpoint files, newest first by modification time.
    pub fn list_checkpoints(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.checkpoints_dir) else {
            return Vec::new();
        };

        let mut checkpoints: Vec<(SystemTime, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                    return None;
                }
                let mtime = entry.metadata().and_then(|m| m.modified()).ok()?;
                Some((mtime, path))
            })
            .collect();

        // Newest first; fall back to name order (also newest first, since
        // the names are sort-correct timestamps) on mtime ties.
        checkpoints.sort_by(|a, b| b.cmp(a));
        checkpoints.into_iter().map(|(_, path)| path).collect()
    }

    /// Most recent checkpoint, if any.
    pub fn latest_checkpoint(&self) -> Option<PathBuf> {
        self.list_checkpoints().into_iter().next()
    }

    /// Delete all but the `keep` newest checkpoints; returns how many were
    /// removed.
    pub fn cleanup_old(&self, keep: usize) -> Result<usize> {
        let checkpoints = self.list_checkpoints();
        let mut removed = 0;
        for path in checkpoints.into_iter().skip(keep) {
            fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Parse and schema-validate a checkpoint. The caller decides whether
    /// to overwrite live state with the result.
    pub fn restore_from_checkpoint(&self, path: &Path) -> Result<OrchestrationState> {
        if !path.exists() {
            return Err(FlowError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = fs::read_to_string(path)?;
        let state: OrchestrationState =
            serde_yaml::from_str(&content).map_err(|e| FlowError::CorruptState {
                field: field_from_serde_message(&e.to_string()),
            })?;
        state.validate()?;
        Ok(state)
    }
}

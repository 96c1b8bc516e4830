//! Atomic persistence for the orchestration state.
//!
//! Saves serialize to a temp file in the same directory, fsync, then rename
//! over the final path, so readers see either the old or the new document.
//! An advisory lock on the sibling lock file excludes other *processes*
//! writing concurrently (e.g. two coordinators launched against the same
//! repository); within one process the coordinator is the only writer.

use fs2::FileExt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{FlowError, Result};
use crate::paths;
use crate::state::model::OrchestrationState;

#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl StateStore {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            state_path: paths::state_file(repo_root),
            lock_path: paths::state_lock_file(repo_root),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Persist the state atomically. Bumps `updated_at` on success entry.
    pub fn save(&self, state: &mut OrchestrationState) -> Result<()> {
        state.mark_updated();
        let document = serde_yaml::to_string(state)?;

        let dir = self
            .state_path
            .parent()
            .expect("state path always has a parent");
        fs::create_dir_all(dir)?;

        let lock_file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        lock_file.lock_exclusive()?;

        let result = self.write_atomic(dir, &document);

        // Errors from unlock are unreachable in practice; the lock dies
        // with the descriptor anyway.
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn write_atomic(&self, dir: &Path, document: &str) -> Result<()> {
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            self.state_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("flow-state.yaml")
        ));

        {
            use std::io::Write;
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(document.as_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.state_path)?;
        Ok(())
    }

    /// Load and schema-validate the persisted state.
    pub fn load(&self) -> Result<OrchestrationState> {
        if !self.state_path.exists() {
            return Err(FlowError::StateNotFound);
        }
        let content = fs::read_to_string(&self.state_path)?;
        let state: OrchestrationState =
            serde_yaml::from_str(&content).map_err(|e| FlowError::CorruptState {
                field: field_from_serde_message(&e.to_string()),
            })?;
        state.validate()?;
        Ok(state)
    }

    pub fn exists(&self) -> bool {
        self.state_path.exists()
    }

    /// Remove the state file and its lock. Idempotent.
    pub fn delete(&self) -> Result<()> {
        for path in [&self.state_path, &self.lock_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Best-effort extraction of the offending field from a serde_yaml message.
pub(crate) fn field_from_serde_message(message: &str) -> String {
    if let Some(start) = message.find("missing field `") {
        let rest = &message[start + "missing field `".len()..];
        if let Some(end) = rest.find('`') {
            return rest[..end].to_string();
        }
    }
    message.to_string()
}

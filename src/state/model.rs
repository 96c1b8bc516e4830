//! Orchestration state document (`.speckit/flow-state.yaml`).
//!
//! The schema mirrors what gets persisted: one record per session, one
//! task-state record per task, plus phase progress and merge status.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{FlowError, Result};
use crate::model::{SessionState, TaskStatus};

pub const STATE_SCHEMA_VERSION: &str = "1.0";

/// Timestamp format used everywhere in persisted documents.
pub fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Outcome of the merge sub-operation, persisted across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    InProgress,
    Completed,
    Failed,
}

/// Execution record for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateRecord {
    pub status: TaskStatus,
    #[serde(default)]
    pub session: Option<usize>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

impl TaskStateRecord {
    pub fn pending(session: Option<usize>) -> Self {
        Self {
            status: TaskStatus::Pending,
            session,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Top-level flow-state.yaml schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationState {
    #[serde(default = "default_version")]
    pub version: String,
    pub spec_id: String,
    pub agent_type: String,
    pub num_sessions: usize,
    pub base_branch: String,
    pub started_at: String,
    pub updated_at: String,
    pub current_phase: String,
    #[serde(default)]
    pub phases_completed: Vec<String>,
    #[serde(default)]
    pub sessions: Vec<SessionState>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskStateRecord>,
    #[serde(default)]
    pub merge_status: Option<MergeStatus>,
}

fn default_version() -> String {
    STATE_SCHEMA_VERSION.to_string()
}

impl OrchestrationState {
    /// Bump `updated_at` to the current instant.
    pub fn mark_updated(&mut self) {
        self.updated_at = now_timestamp();
    }

    pub fn session(&self, session_id: usize) -> Option<&SessionState> {
        self.sessions.iter().find(|s| s.session_id == session_id)
    }

    pub fn session_mut(&mut self, session_id: usize) -> Option<&mut SessionState> {
        self.sessions.iter_mut().find(|s| s.session_id == session_id)
    }

    /// Schema validation. Returns [`FlowError::CorruptState`] naming the
    /// first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(corrupt("version"));
        }
        if self.spec_id.trim().is_empty() {
            return Err(corrupt("spec_id"));
        }
        if self.agent_type.trim().is_empty() {
            return Err(corrupt("agent_type"));
        }
        if self.num_sessions < 1 {
            return Err(corrupt("num_sessions"));
        }
        if parse_phase_index(&self.current_phase).is_none() {
            return Err(corrupt("current_phase"));
        }

        // Completed phases must be the prefix phase-0, phase-1, ...
        for (idx, name) in self.phases_completed.iter().enumerate() {
            if name != &format!("phase-{idx}") {
                return Err(corrupt("phases_completed"));
            }
        }

        for session in &self.sessions {
            if session.session_id >= self.num_sessions {
                return Err(corrupt("sessions.session_id"));
            }
        }

        for (task_id, record) in &self.tasks {
            if !crate::model::is_task_id(task_id) {
                return Err(corrupt("tasks"));
            }
            if let Some(session) = record.session
                && session >= self.num_sessions
            {
                return Err(FlowError::CorruptState {
                    field: format!("tasks.{task_id}.session"),
                });
            }
        }

        // ISO-8601 Z strings compare correctly as strings.
        if self.updated_at < self.started_at {
            return Err(corrupt("updated_at"));
        }

        Ok(())
    }
}

fn corrupt(field: &str) -> FlowError {
    FlowError::CorruptState {
        field: field.to_string(),
    }
}

/// Parse the index out of a `phase-{i}` name.
pub fn parse_phase_index(name: &str) -> Option<usize> {
    name.strip_prefix("phase-")?.parse().ok()
}

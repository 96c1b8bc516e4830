//! Shared domain types for the orchestrator.
//!
//! Tasks, sessions, and their status enums are referenced by identifier
//! everywhere (task ids like `T001`, session indices); the only structural
//! graph lives in [`crate::dag`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static TASK_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^T\d{3}$").unwrap());

/// Check whether a string has the `T###` task identifier shape.
pub fn is_task_id(candidate: &str) -> bool {
    TASK_ID_REGEX.is_match(candidate)
}

/// Task execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Session execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Executing,
    Waiting,
    Completed,
    Failed,
}

/// A unit of work in the dependency graph.
///
/// `session` is filled in by [`crate::dag::DagEngine::assign_sessions`];
/// `status` is mutated only by the session coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task identifier like `T001`
    pub id: String,
    /// Human-readable task name
    pub name: String,
    /// Optional longer description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Identifiers of tasks that must complete before this one
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Assigned session index, if any
    #[serde(default)]
    pub session: Option<usize>,
    /// Whether this task may run concurrently with its phase peers
    #[serde(default)]
    pub parallelizable: bool,
    /// Optional grouping tag (user story)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story: Option<String>,
    /// Files this task is expected to touch
    #[serde(default)]
    pub files: Vec<String>,
    /// Execution status
    #[serde(default)]
    pub status: TaskStatus,
}

impl TaskInfo {
    /// Convenience constructor for the common fields.
    pub fn new(id: &str, name: &str, dependencies: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            dependencies,
            session: None,
            parallelizable: false,
            story: None,
            files: Vec::new(),
            status: TaskStatus::Pending,
        }
    }

    /// Builder-style toggle for the parallelizable flag.
    pub fn parallel(mut self, parallelizable: bool) -> Self {
        self.parallelizable = parallelizable;
        self
    }
}

/// State of one concurrency lane: an isolated worktree plus its branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Session index (0-based)
    pub session_id: usize,
    /// Worktree path relative to the repository root
    pub worktree_path: String,
    /// Integration-line branch for this session
    pub branch_name: String,
    /// Currently executing task id, if any
    #[serde(default)]
    pub current_task: Option<String>,
    /// Task ids completed by this session, in completion order
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    /// Session status
    #[serde(default)]
    pub status: SessionStatus,
}

impl SessionState {
    pub fn new(session_id: usize, worktree_path: &str, branch_name: &str) -> Self {
        Self {
            session_id,
            worktree_path: worktree_path.to_string(),
            branch_name: branch_name.to_string(),
            current_task: None,
            completed_tasks: Vec::new(),
            status: SessionStatus::Idle,
        }
    }
}

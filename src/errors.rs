//! Typed error hierarchy for the skflow orchestrator.
//!
//! One enum covers the whole pipeline, grouped by kind:
//! - environment errors (missing repo, missing files, timeouts)
//! - input errors (cycles, bad arguments, unsupported agents)
//! - conflict errors (existing worktrees, branches, merge conflicts)
//! - corruption errors (unreadable state or DAG documents)
//! - unclassified git failures, propagated with command and stderr

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    // --- environment ---
    #[error("Not inside a git repository: {dir}\nRun from a repository, or pass --repo <path>")]
    NotInGitRepo { dir: PathBuf },

    #[error("Feature not found: {what}")]
    FeatureNotFound { what: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error(
        "Timeout waiting for tasks to complete. Pending: {pending:?}, Completed: {completed:?}"
    )]
    Timeout {
        completed: Vec<String>,
        pending: Vec<String>,
    },

    // --- input ---
    #[error("Invalid task format: {message}")]
    InvalidTaskFormat { message: String },

    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported agent type '{agent_type}'. Supported: copilot")]
    UnsupportedAgent { agent_type: String },

    #[error("Invalid configuration field '{field}': {message}")]
    ConfigInvalid { field: String, message: String },

    // --- conflict ---
    #[error("Worktree already exists at: {path}\nRemove it first with: git worktree remove {path}")]
    WorktreePathExists { path: PathBuf },

    #[error(
        "Branch '{branch}' already exists.\nIf resuming, reuse the existing worktree.\nTo start fresh, delete the branch first: git branch -D {branch}"
    )]
    WorktreeBranchExists { branch: String },

    #[error("Orchestration state already exists. Run 'skf run' to resume or 'skf abort' to reset")]
    StateAlreadyExists,

    #[error(
        "Integration branch '{branch}' already exists. Delete it first or use a different spec id"
    )]
    IntegrationBranchExists { branch: String },

    #[error(
        "Merge conflict in session {session}. Conflicting files: {}", files.join(", ")
    )]
    MergeConflict {
        session: usize,
        files: Vec<String>,
    },

    // --- corruption ---
    #[error("Corrupt orchestration state: invalid field '{field}'")]
    CorruptState { field: String },

    #[error("Corrupt DAG document: missing or invalid field '{field}'")]
    CorruptDag { field: String },

    #[error("No orchestration state found. Run 'skf init' or 'skf run' first")]
    StateNotFound,

    // --- cancellation ---
    #[error("Interrupted by user. State saved; run again to resume")]
    Interrupted,

    // --- fatal ---
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    /// Whether this error denotes a clean interrupted-resume-needed exit,
    /// which maps to exit code 0 for the operator wrapper.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, FlowError::Interrupted)
    }
}

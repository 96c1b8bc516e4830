//! Worktree isolation and branch integration.
//!
//! The manager materialises one worktree per session; the merger analyses
//! and serially integrates the session branches once work is complete.

mod manager;
mod merger;

pub use manager::{WorktreeInfo, WorktreeManager, sanitize_task_name};
pub use merger::{
    MergeAnalysis, MergeOrchestrator, MergeReport, MergeSummary, SessionChanges,
};

//! Session branch merging with conflict pre-analysis.
//!
//! Before merging, each session's branch is diffed against the base to
//! build a file-to-sessions overlap map; the merge itself runs serially
//! per session with `--no-ff`, and a conflict rolls the repository back to
//! base with the integration branch deleted.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::errors::{FlowError, Result};
use crate::git::Git;
use crate::paths;
use crate::worktree::WorktreeManager;

/// File changes one session branch carries relative to base.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionChanges {
    pub session_id: usize,
    pub branch_name: String,
    pub added_files: BTreeSet<String>,
    pub modified_files: BTreeSet<String>,
    pub deleted_files: BTreeSet<String>,
}

impl SessionChanges {
    /// Union of all change categories.
    pub fn all_changed_files(&self) -> BTreeSet<String> {
        self.added_files
            .iter()
            .chain(&self.modified_files)
            .chain(&self.deleted_files)
            .cloned()
            .collect()
    }
}

/// Pre-merge analysis across all session branches of a spec.
#[derive(Debug, Clone)]
pub struct MergeAnalysis {
    pub base_branch: String,
    /// Sorted by session index
    pub session_changes: Vec<SessionChanges>,
    /// Paths touched by two or more sessions
    pub overlapping_files: BTreeMap<String, Vec<usize>>,
}

impl MergeAnalysis {
    /// No file was touched by more than one session.
    pub fn safe_to_merge(&self) -> bool {
        self.overlapping_files.is_empty()
    }

    /// Unique files changed across all sessions.
    pub fn total_files_changed(&self) -> usize {
        self.session_changes
            .iter()
            .flat_map(|s| s.all_changed_files())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Outcome of the sequential merge.
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub success: bool,
    pub integration_branch: String,
    pub merged_sessions: Vec<usize>,
    pub conflict_session: Option<usize>,
    pub conflicting_files: Vec<String>,
    pub error_message: Option<String>,
}

/// Integration statistics returned by finalise.
#[derive(Debug, Clone, Default)]
pub struct MergeSummary {
    pub files_changed: usize,
    pub lines_added: usize,
    pub lines_deleted: usize,
    pub worktrees_removed: usize,
    pub integration_branch: String,
}

pub struct MergeOrchestrator {
    spec_id: String,
    repo_root: PathBuf,
    git: Git,
}

impl MergeOrchestrator {
    pub fn new(spec_id: &str, repo_root: &Path) -> Self {
        Self {
            spec_id: spec_id.to_string(),
            repo_root: repo_root.to_path_buf(),
            git: Git::new(repo_root),
        }
    }

    /// Diff every session branch against base and detect overlaps.
    pub async fn analyze(&self, base_branch: Option<&str>) -> Result<MergeAnalysis> {
        let base = self.resolve_base(base_branch).await?;
        let branches = self.find_session_branches().await?;
        if branches.is_empty() {
            return Err(FlowError::FeatureNotFound {
                what: format!(
                    "no session branches for spec '{}' (expected impl-{}-session-*)",
                    self.spec_id, self.spec_id
                ),
            });
        }

        let mut session_changes = Vec::new();
        for (&session_id, branch_name) in &branches {
            session_changes.push(self.branch_changes(&base, branch_name, session_id).await?);
        }

        let overlapping_files = detect_overlaps(&session_changes);

        Ok(MergeAnalysis {
            base_branch: base,
            session_changes,
            overlapping_files,
        })
    }

    /// Merge session branches into `impl-{spec}-integrated`, ascending by
    /// session index, with `--no-ff`. A conflict aborts the merge, returns
    /// the repository to base, deletes the integration branch, and reports
    /// the conflicting session and paths.
    pub async fn merge_sequential(&self, base_branch: Option<&str>) -> Result<MergeReport> {
        let base = self.resolve_base(base_branch).await?;
        let branches = self.find_session_branches().await?;
        if branches.is_empty() {
            return Err(FlowError::FeatureNotFound {
                what: format!(
                    "no session branches for spec '{}' (expected impl-{}-session-*)",
                    self.spec_id, self.spec_id
                ),
            });
        }

        let integration = paths::integration_branch(&self.spec_id);
        if self.git.branch_exists(&integration).await? {
            return Err(FlowError::IntegrationBranchExists {
                branch: integration,
            });
        }

        self.git.checkout_new(&integration, &base).await?;

        let mut merged_sessions = Vec::new();
        for (&session_id, branch_name) in &branches {
            let message = format!("Merge session {session_id} ({branch_name})");
            let merge = self
                .git
                .try_run(&["merge", "--no-ff", "-m", &message, branch_name])
                .await;

            match merge {
                Ok((true, _, _)) => merged_sessions.push(session_id),
                Ok((false, _, _)) => {
                    let conflicting_files = self.conflicting_files().await;
                    self.rollback(&base, &integration).await;

                    return Ok(MergeReport {
                        success: false,
                        integration_branch: integration.clone(),
                        merged_sessions,
                        conflict_session: Some(session_id),
                        error_message: Some(
                            FlowError::MergeConflict {
                                session: session_id,
                                files: conflicting_files.clone(),
                            }
                            .to_string(),
                        ),
                        conflicting_files,
                    });
                }
                Err(e) => {
                    // Not a conflict: clean up identically, then re-raise.
                    self.rollback(&base, &integration).await;
                    return Err(e);
                }
            }
        }

        Ok(MergeReport {
            success: true,
            integration_branch: integration,
            merged_sessions,
            conflict_session: None,
            conflicting_files: Vec::new(),
            error_message: None,
        })
    }

    /// Check out the integration branch and run a validation command.
    /// Returns `(success, combined stdout+stderr)`; a missing command is a
    /// skipped pass.
    pub async fn validate(&self, test_cmd: Option<&str>) -> Result<(bool, String)> {
        let Some(cmd) = test_cmd else {
            return Ok((true, "skipped".to_string()));
        };

        let integration = paths::integration_branch(&self.spec_id);
        self.git.checkout(&integration).await?;

        let output = tokio::process::Command::new("sh")
            .args(["-c", cmd])
            .current_dir(&self.repo_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        Ok((output.status.success(), combined))
    }

    /// Integration statistics plus optional worktree teardown.
    pub async fn finalize(&self, keep_worktrees: bool) -> Result<MergeSummary> {
        let integration = paths::integration_branch(&self.spec_id);
        let mut summary = self.merge_statistics(&integration).await;
        summary.integration_branch = integration;

        if !keep_worktrees {
            let manager = WorktreeManager::new(&self.repo_root);
            summary.worktrees_removed = manager.cleanup_spec(&self.spec_id).await;
        }

        Ok(summary)
    }

    async fn resolve_base(&self, base_branch: Option<&str>) -> Result<String> {
        match base_branch {
            Some(base) => Ok(base.to_string()),
            None => self.git.current_branch().await,
        }
    }

    /// Session branches matching `impl-{spec}-session-*`, keyed and sorted
    /// by the numeric suffix; malformed names are ignored.
    async fn find_session_branches(&self) -> Result<BTreeMap<usize, String>> {
        let pattern = format!("impl-{}-session-*", self.spec_id);
        let (ok, stdout, _) = self.git.try_run(&["branch", "--list", &pattern]).await?;
        if !ok {
            return Ok(BTreeMap::new());
        }

        let prefix = format!("impl-{}-session-", self.spec_id);
        let mut branches = BTreeMap::new();
        for line in stdout.lines() {
            let branch = line.trim().trim_start_matches("* ").trim();
            if let Some(suffix) = branch.strip_prefix(&prefix)
                && let Ok(session_id) = suffix.parse::<usize>()
            {
                branches.insert(session_id, branch.to_string());
            }
        }
        Ok(branches)
    }

    /// Classify one branch's diff against base via name-status output.
    async fn branch_changes(
        &self,
        base: &str,
        branch: &str,
        session_id: usize,
    ) -> Result<SessionChanges> {
        let range = format!("{base}...{branch}");
        let output = self
            .git
            .run(&["diff", "--name-status", &range])
            .await?;

        let mut changes = SessionChanges {
            session_id,
            branch_name: branch.to_string(),
            ..Default::default()
        };

        for line in output.lines() {
            let mut parts = line.split('\t');
            let Some(status) = parts.next() else { continue };
            let Some(first_path) = parts.next() else { continue };

            match status.chars().next() {
                Some('A') => {
                    changes.added_files.insert(first_path.to_string());
                }
                Some('M') => {
                    changes.modified_files.insert(first_path.to_string());
                }
                Some('D') => {
                    changes.deleted_files.insert(first_path.to_string());
                }
                Some('R') => {
                    // R<score>\told\tnew: record the new path as modified.
                    let new_path = parts.next().unwrap_or(first_path);
                    changes.modified_files.insert(new_path.to_string());
                }
                _ => {}
            }
        }

        Ok(changes)
    }

    async fn conflicting_files(&self) -> Vec<String> {
        match self
            .git
            .run(&["diff", "--name-only", "--diff-filter=U"])
            .await
        {
            Ok(output) => output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Return the repository to base and drop the integration branch.
    /// Best-effort: the merge failure being reported matters more than any
    /// cleanup hiccup.
    async fn rollback(&self, base: &str, integration: &str) {
        let _ = self.git.try_run(&["merge", "--abort"]).await;
        let _ = self.git.try_run(&["checkout", base]).await;
        let _ = self.git.try_run(&["branch", "-D", integration]).await;
    }

    /// Shortstat diff of the integration branch against its merge-base
    /// with the current branch; zeros on any failure.
    async fn merge_statistics(&self, integration: &str) -> MergeSummary {
        let base = match self.git.current_branch().await {
            Ok(b) if b != *integration => b,
            _ => "main".to_string(),
        };

        let base_ref = match self.git.try_run(&["merge-base", &base, integration]).await {
            Ok((true, stdout, _)) if !stdout.is_empty() => stdout,
            _ => base,
        };

        match self
            .git
            .try_run(&["diff", "--shortstat", &base_ref, integration])
            .await
        {
            Ok((true, stdout, _)) => parse_shortstat(&stdout),
            _ => MergeSummary::default(),
        }
    }
}

/// Map each path to the sessions that touched it, keeping multiplicity >= 2.
fn detect_overlaps(session_changes: &[SessionChanges]) -> BTreeMap<String, Vec<usize>> {
    let mut file_to_sessions: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for session in session_changes {
        for file in session.all_changed_files() {
            file_to_sessions.entry(file).or_default().push(session.session_id);
        }
    }
    file_to_sessions.retain(|_, sessions| sessions.len() > 1);
    file_to_sessions
}

/// Parse "N files changed, X insertions(+), Y deletions(-)".
fn parse_shortstat(shortstat: &str) -> MergeSummary {
    let mut summary = MergeSummary::default();
    for part in shortstat.split(',') {
        let part = part.trim();
        let Some(number) = part.split_whitespace().next().and_then(|n| n.parse().ok()) else {
            continue;
        };
        if part.contains("file") {
            summary.files_changed = number;
        } else if part.contains("insertion") {
            summary.lines_added = number;
        } else if part.contains("deletion") {
            summary.lines_deleted = number;
        }
    }
    summary
}

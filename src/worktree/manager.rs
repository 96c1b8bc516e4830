//! Git worktree lifecycle for parallel sessions.
//!
//! Each session gets an isolated worktree under
//! `.worktrees-{spec_id}/session-{i}-{slug}/` checked out on its own
//! integration branch `impl-{spec_id}-session-{i}`. The orchestrator never
//! writes into a worktree after creation; the agent adapter does the
//! one-shot context write during setup.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::{FlowError, Result};
use crate::git::Git;
use crate::paths;

/// Cap on the task-derived directory slug.
const MAX_TASK_SLUG_LENGTH: usize = 50;

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    /// Branch name, or the literal `(detached)`
    pub branch: String,
    pub commit: String,
    pub locked: bool,
}

pub struct WorktreeManager {
    repo_root: PathBuf,
    git: Git,
}

impl WorktreeManager {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            git: Git::new(repo_root),
        }
    }

    /// Create a session worktree and its integration branch off the
    /// current HEAD.
    ///
    /// Fails with a worktree-exists error when either the target directory
    /// or the branch is already present; the two cases carry different
    /// remediation hints.
    pub async fn create(
        &self,
        spec_id: &str,
        session_id: usize,
        task_name: &str,
    ) -> Result<PathBuf> {
        let slug = sanitize_task_name(task_name);
        let branch_name = paths::session_branch(spec_id, session_id);
        let worktrees_base = paths::worktrees_dir(&self.repo_root, spec_id);
        let worktree_path = worktrees_base.join(format!("session-{session_id}-{slug}"));

        if worktree_path.exists() {
            return Err(FlowError::WorktreePathExists {
                path: worktree_path,
            });
        }
        if self.git.branch_exists(&branch_name).await? {
            return Err(FlowError::WorktreeBranchExists {
                branch: branch_name,
            });
        }

        fs::create_dir_all(&worktrees_base)?;

        let path_str = worktree_path.to_str().ok_or_else(|| {
            FlowError::InvalidArgument(format!(
                "worktree path is not valid UTF-8: {}",
                worktree_path.display()
            ))
        })?;

        match self
            .git
            .run(&["worktree", "add", "-b", &branch_name, path_str])
            .await
        {
            Ok(_) => Ok(worktree_path),
            Err(FlowError::Git { stderr, .. })
                if stderr.to_lowercase().contains("already exists") =>
            {
                // Raced against another creator; report the branch case.
                Err(FlowError::WorktreeBranchExists {
                    branch: branch_name,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// All worktrees known to the repository. Any git failure yields an
    /// empty list.
    pub async fn list(&self) -> Vec<WorktreeInfo> {
        match self.git.run(&["worktree", "list", "--porcelain"]).await {
            Ok(output) => parse_worktree_list(&output),
            Err(_) => Vec::new(),
        }
    }

    /// Remove a clean worktree; fails if it has local modifications.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.git.run(&["worktree", "remove", &path_str]).await?;
        Ok(())
    }

    /// Remove a worktree unconditionally, discarding local modifications.
    pub async fn remove_force(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.git
            .run(&["worktree", "remove", "--force", &path_str])
            .await?;
        Ok(())
    }

    /// Worktrees whose path lies under this spec's `.worktrees-{spec_id}/`.
    pub async fn spec_worktrees(&self, spec_id: &str) -> Vec<WorktreeInfo> {
        let base = paths::worktrees_dir(&self.repo_root, spec_id);
        let base = base.canonicalize().unwrap_or(base);
        self.list()
            .await
            .into_iter()
            .filter(|wt| {
                let path = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
                path.starts_with(&base)
            })
            .collect()
    }

    /// Force-remove every worktree of a spec, then delete the parent
    /// directory. Individual failures are logged and skipped so partial
    /// cleanup still happens. Session branches are preserved, so work
    /// remains recoverable.
    pub async fn cleanup_spec(&self, spec_id: &str) -> usize {
        let mut removed = 0;
        for worktree in self.spec_worktrees(spec_id).await {
            match self.remove_force(&worktree.path).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = %worktree.path.display(), error = %e, "worktree removal failed");
                }
            }
        }

        let base = paths::worktrees_dir(&self.repo_root, spec_id);
        if base.exists()
            && let Err(e) = fs::remove_dir_all(&base)
        {
            warn!(path = %base.display(), error = %e, "could not remove worktrees directory");
        }

        removed
    }
}

/// Lower-case, collapse non-alphanumerics to single hyphens, trim hyphens,
/// cap the length, and fall back to "task" when nothing survives.
pub fn sanitize_task_name(task_name: &str) -> String {
    let slug: String = task_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    let slug = if slug.len() > MAX_TASK_SLUG_LENGTH {
        slug[..MAX_TASK_SLUG_LENGTH].trim_end_matches('-').to_string()
    } else {
        slug
    };

    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

/// Parse `git worktree list --porcelain` output: blank-line separated
/// blocks of `worktree <path>`, `HEAD <sha>`, and either
/// `branch refs/heads/<name>` or `detached`, with an optional `locked` line.
fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut commit: Option<String> = None;
    let mut branch: Option<String> = None;
    let mut locked = false;

    let mut flush = |path: &mut Option<PathBuf>,
                     commit: &mut Option<String>,
                     branch: &mut Option<String>,
                     locked: &mut bool| {
        if let (Some(p), Some(c)) = (path.take(), commit.take()) {
            worktrees.push(WorktreeInfo {
                path: p,
                branch: branch.take().unwrap_or_else(|| "(unknown)".to_string()),
                commit: c,
                locked: *locked,
            });
        }
        *branch = None;
        *locked = false;
    };

    for line in porcelain.lines() {
        let line = line.trim();
        if line.is_empty() {
            flush(&mut path, &mut commit, &mut branch, &mut locked);
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            commit = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(
                rest.strip_prefix("refs/heads/")
                    .unwrap_or(rest)
                    .to_string(),
            );
        } else if line == "detached" {
            branch = Some("(detached)".to_string());
        } else if line.starts_with("locked") {
            locked = true;
        }
    }
    flush(&mut path, &mut commit, &mut branch, &mut locked);

    worktrees
}

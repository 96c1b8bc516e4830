//! Repository layout constants and path helpers.
//!
//! Everything the orchestrator persists lives under two roots:
//! `.speckit/` for state, completions, and checkpoints, and
//! `specs/{branch}/` for the feature's documents.

use std::path::{Path, PathBuf};

use crate::errors::Result;
use crate::git::Git;

pub const SPECKIT_DIR: &str = ".speckit";
pub const CONFIG_FILE: &str = "speckit-flow.yaml";
pub const STATE_FILE: &str = "flow-state.yaml";
pub const STATE_LOCK_FILE: &str = "flow-state.lock";
pub const COMPLETIONS_DIR: &str = "completions";
pub const CHECKPOINTS_DIR: &str = "checkpoints";
pub const SPECS_DIR: &str = "specs";

pub fn speckit_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(SPECKIT_DIR)
}

pub fn config_file(repo_root: &Path) -> PathBuf {
    speckit_dir(repo_root).join(CONFIG_FILE)
}

pub fn state_file(repo_root: &Path) -> PathBuf {
    speckit_dir(repo_root).join(STATE_FILE)
}

pub fn state_lock_file(repo_root: &Path) -> PathBuf {
    speckit_dir(repo_root).join(STATE_LOCK_FILE)
}

pub fn completions_dir(repo_root: &Path) -> PathBuf {
    speckit_dir(repo_root).join(COMPLETIONS_DIR)
}

pub fn checkpoints_dir(repo_root: &Path) -> PathBuf {
    speckit_dir(repo_root).join(CHECKPOINTS_DIR)
}

/// Root directory for a spec's session worktrees.
pub fn worktrees_dir(repo_root: &Path, spec_id: &str) -> PathBuf {
    repo_root.join(format!(".worktrees-{spec_id}"))
}

/// Feature directory for a branch: `specs/{branch}/`.
pub fn feature_dir(repo_root: &Path, branch: &str) -> PathBuf {
    repo_root.join(SPECS_DIR).join(branch)
}

/// The observed checkbox file for a branch.
pub fn tasks_file(repo_root: &Path, branch: &str) -> PathBuf {
    feature_dir(repo_root, branch).join("tasks.md")
}

/// Serialized DAG document for a branch.
pub fn dag_file(repo_root: &Path, branch: &str) -> PathBuf {
    feature_dir(repo_root, branch).join("dag.yaml")
}

/// Plain YAML task list for a branch (input to `skf dag`).
pub fn task_list_file(repo_root: &Path, branch: &str) -> PathBuf {
    feature_dir(repo_root, branch).join("tasks.yaml")
}

/// Integration-line branch name for one session of a spec.
pub fn session_branch(spec_id: &str, session_id: usize) -> String {
    format!("impl-{spec_id}-session-{session_id}")
}

/// Final merge target branch name for a spec.
pub fn integration_branch(spec_id: &str) -> String {
    format!("impl-{spec_id}-integrated")
}

/// Resolve the repository root containing `start`.
pub async fn discover_repo_root(start: &Path) -> Result<PathBuf> {
    Git::discover_root(start).await
}

/// Locate the tasks.md to observe for checkbox completions: the current
/// branch's feature directory first, then common fallbacks.
pub async fn resolve_tasks_file(repo_root: &Path, base_branch: &str) -> Option<PathBuf> {
    let git = Git::new(repo_root);
    if let Ok(branch) = git.current_branch().await {
        let candidate = tasks_file(repo_root, &branch);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    for branch in ["main", "master", base_branch] {
        let candidate = tasks_file(repo_root, branch);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn layout_is_rooted_under_speckit() {
        let root = Path::new("/repo");
        assert_eq!(
            state_file(root),
            PathBuf::from("/repo/.speckit/flow-state.yaml")
        );
        assert_eq!(
            state_lock_file(root),
            PathBuf::from("/repo/.speckit/flow-state.lock")
        );
        assert_eq!(
            completions_dir(root),
            PathBuf::from("/repo/.speckit/completions")
        );
        assert_eq!(
            checkpoints_dir(root),
            PathBuf::from("/repo/.speckit/checkpoints")
        );
    }

    #[test]
    fn spec_scoped_names() {
        let root = Path::new("/repo");
        assert_eq!(
            worktrees_dir(root, "001-auth"),
            PathBuf::from("/repo/.worktrees-001-auth")
        );
        assert_eq!(session_branch("001-auth", 2), "impl-001-auth-session-2");
        assert_eq!(integration_branch("001-auth"), "impl-001-auth-integrated");
    }

    #[test]
    fn feature_paths() {
        let root = Path::new("/repo");
        assert_eq!(
            tasks_file(root, "007-feature"),
            PathBuf::from("/repo/specs/007-feature/tasks.md")
        );
        assert_eq!(
            dag_file(root, "007-feature"),
            PathBuf::from("/repo/specs/007-feature/dag.yaml")
        );
    }

    #[tokio::test]
    async fn resolve_tasks_file_falls_back_to_base_branch() {
        let dir = tempdir().unwrap();
        crate::git::test_support::init_repo(dir.path());
        crate::git::test_support::commit_file(dir.path(), "a.txt", "x", "init");

        // No tasks.md anywhere yet.
        assert!(resolve_tasks_file(dir.path(), "develop").await.is_none());

        // Fallback location for the base branch.
        let fallback = tasks_file(dir.path(), "develop");
        fs::create_dir_all(fallback.parent().unwrap()).unwrap();
        fs::write(&fallback, "- [ ] [T001] something\n").unwrap();
        assert_eq!(
            resolve_tasks_file(dir.path(), "develop").await,
            Some(fallback)
        );
    }
}

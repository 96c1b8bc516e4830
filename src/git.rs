//! Thin async wrapper over the `git` command surface.
//!
//! Every version-control interaction in the orchestrator goes through this
//! module so failures carry the exact command and stderr that produced them.

use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::errors::{FlowError, Result};

/// Runs git commands rooted at a repository directory.
#[derive(Debug, Clone)]
pub struct Git {
    repo_root: PathBuf,
}

impl Git {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Run a git command, returning trimmed stdout. Non-zero exit becomes
    /// [`FlowError::Git`] carrying the command line and stderr.
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await?;

        if !output.status.success() {
            return Err(FlowError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run a git command without failing on non-zero exit.
    /// Returns (success, stdout, stderr).
    pub async fn try_run(&self, args: &[&str]) -> Result<(bool, String, String)> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await?;

        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }

    /// Resolve the repository root containing `dir`.
    pub async fn discover_root(dir: &Path) -> Result<PathBuf> {
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(dir)
            .output()
            .await?;

        if !output.status.success() {
            return Err(FlowError::NotInGitRepo {
                dir: dir.to_path_buf(),
            });
        }

        Ok(PathBuf::from(
            String::from_utf8_lossy(&output.stdout).trim(),
        ))
    }

    /// Current branch name. A detached HEAD falls back to "main".
    pub async fn current_branch(&self) -> Result<String> {
        let branch = self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        if branch == "HEAD" {
            return Ok("main".to_string());
        }
        Ok(branch)
    }

    /// Whether a local branch with this name exists.
    pub async fn branch_exists(&self, name: &str) -> Result<bool> {
        let (ok, _, _) = self
            .try_run(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{name}")])
            .await?;
        Ok(ok)
    }

    /// Delete a local branch unconditionally.
    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        self.run(&["branch", "-D", name]).await?;
        Ok(())
    }

    pub async fn checkout(&self, name: &str) -> Result<()> {
        self.run(&["checkout", name]).await?;
        Ok(())
    }

    /// Create a branch off `base` and check it out.
    pub async fn checkout_new(&self, name: &str, base: &str) -> Result<()> {
        self.run(&["checkout", "-b", name, base]).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers for tests that need a real repository in a temp dir.

    use super::*;
    use std::fs;
    use std::process::Command as StdCommand;

    pub fn init_repo(dir: &Path) {
        run(dir, &["init", "--initial-branch=main"]);
        run(dir, &["config", "user.name", "test"]);
        run(dir, &["config", "user.email", "test@test.com"]);
    }

    pub fn run(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            status.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&status.stderr)
        );
    }

    pub fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        run(dir, &["add", "."]);
        run(dir, &["commit", "-m", msg]);
    }
}

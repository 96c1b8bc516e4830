//! Agent adapters: the capability seam between the orchestrator and
//! whatever coding agent the operator drives.
//!
//! The coordinator only ever talks to the [`AgentAdapter`] trait: write
//! context into a worktree, prompt the operator, and say which files signal
//! completion. Adapters are interchangeable capability objects, not a
//! hierarchy.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{FlowError, Result};
use crate::model::TaskInfo;

/// Capability set consumed by the session coordinator.
pub trait AgentAdapter: Send + Sync + std::fmt::Debug {
    /// One-shot context setup in a freshly created worktree.
    fn setup_session(&self, worktree: &Path, task: &TaskInfo) -> Result<()>;

    /// Prompt the operator to start working in a session's worktree.
    fn notify_user(&self, session_id: usize, worktree: &Path, task: &TaskInfo) -> Result<()>;

    /// Files whose modification signals progress for this agent.
    fn files_to_watch(&self, worktree: &Path) -> Vec<PathBuf>;

    /// Where the agent reads its task context from.
    fn context_file_path(&self, worktree: &Path) -> PathBuf;
}

/// Look up an adapter by its configured identifier.
pub fn resolve_adapter(agent_type: &str) -> Result<Box<dyn AgentAdapter>> {
    match agent_type {
        "copilot" => Ok(Box::new(CopilotAdapter)),
        other => Err(FlowError::UnsupportedAgent {
            agent_type: other.to_string(),
        }),
    }
}

/// GitHub Copilot in notification mode: context goes into
/// `.github/copilot-instructions.md`, the operator opens the worktree in
/// their IDE and runs the implement command there.
#[derive(Debug)]
pub struct CopilotAdapter;

impl CopilotAdapter {
    fn build_context(task: &TaskInfo) -> String {
        let mut content = format!(
            "# Task Context\n\n## {id}: {name}\n\n",
            id = task.id,
            name = task.name
        );

        if let Some(description) = &task.description {
            content.push_str(description);
            content.push_str("\n\n");
        }
        if !task.dependencies.is_empty() {
            content.push_str(&format!(
                "Dependencies (already completed): {}\n\n",
                task.dependencies.join(", ")
            ));
        }
        if !task.files.is_empty() {
            content.push_str("Files to modify:\n");
            for file in &task.files {
                content.push_str(&format!("- {file}\n"));
            }
            content.push('\n');
        }
        content.push_str(
            "When the task is done, mark its checkbox in tasks.md or run `skf complete TASK_ID`.\n",
        );
        content
    }
}

impl AgentAdapter for CopilotAdapter {
    fn setup_session(&self, worktree: &Path, task: &TaskInfo) -> Result<()> {
        let context_file = self.context_file_path(worktree);
        if let Some(parent) = context_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(context_file, Self::build_context(task))?;
        Ok(())
    }

    fn notify_user(&self, session_id: usize, worktree: &Path, task: &TaskInfo) -> Result<()> {
        println!();
        println!(
            "{}",
            console::style(format!("Session {session_id}: action required"))
                .yellow()
                .bold()
        );
        println!(
            "  Task: {} - {}",
            console::style(&task.id).cyan(),
            task.name
        );
        if !task.dependencies.is_empty() {
            println!(
                "  Dependencies: {}",
                console::style(task.dependencies.join(", ")).dim()
            );
        }
        if !task.files.is_empty() {
            println!("  Files: {}", console::style(task.files.join(", ")).dim());
        }
        println!();
        println!("  1. Open this folder in VS Code:");
        println!("     {}", console::style(worktree.display()).green());
        println!("  2. Run the Copilot command: {}", console::style("/speckit.implement").cyan());
        println!(
            "  3. When complete, mark the checkbox in tasks.md or run: {}",
            console::style(format!("skf complete {}", task.id)).cyan()
        );
        println!();
        Ok(())
    }

    fn files_to_watch(&self, worktree: &Path) -> Vec<PathBuf> {
        // Copilot completion is signalled through the tasks.md checkboxes.
        let specs = worktree.join("specs");
        let Ok(entries) = fs::read_dir(&specs) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path().join("tasks.md"))
            .filter(|p| p.exists())
            .collect()
    }

    fn context_file_path(&self, worktree: &Path) -> PathBuf {
        worktree.join(".github").join("copilot-instructions.md")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn task() -> TaskInfo {
        let mut task = TaskInfo::new("T001", "Setup database", vec![]);
        task.description = Some("Create the initial schema".to_string());
        task.files = vec!["db/schema.sql".to_string()];
        task
    }

    #[test]
    fn unknown_agent_rejected() {
        let err = resolve_adapter("clippy").unwrap_err();
        match err {
            FlowError::UnsupportedAgent { agent_type } => assert_eq!(agent_type, "clippy"),
            other => panic!("expected UnsupportedAgent, got {other:?}"),
        }
    }

    #[test]
    fn copilot_resolves() {
        assert!(resolve_adapter("copilot").is_ok());
    }

    #[test]
    fn setup_session_writes_context_file() {
        let dir = tempdir().unwrap();
        let adapter = CopilotAdapter;
        adapter.setup_session(dir.path(), &task()).unwrap();

        let context = dir.path().join(".github/copilot-instructions.md");
        assert!(context.exists());
        assert_eq!(adapter.context_file_path(dir.path()), context);

        let content = fs::read_to_string(context).unwrap();
        assert!(content.contains("T001"));
        assert!(content.contains("Setup database"));
        assert!(content.contains("db/schema.sql"));
        assert!(content.contains("skf complete"));
    }

    #[test]
    fn files_to_watch_lists_feature_tasks_files() {
        let dir = tempdir().unwrap();
        let adapter = CopilotAdapter;
        assert!(adapter.files_to_watch(dir.path()).is_empty());

        let feature = dir.path().join("specs/001-demo");
        fs::create_dir_all(&feature).unwrap();
        fs::write(feature.join("tasks.md"), "- [ ] [T001] x\n").unwrap();

        let watched = adapter.files_to_watch(dir.path());
        assert_eq!(watched.len(), 1);
        assert!(watched[0].ends_with("specs/001-demo/tasks.md"));
    }

    #[test]
    fn notify_user_does_not_fail() {
        let adapter = CopilotAdapter;
        adapter.notify_user(0, Path::new("/tmp/wt"), &task()).unwrap();
    }
}

//! Completion detection for orchestrated tasks.
//!
//! Two signal channels feed a set union:
//! - marker files: an empty `.speckit/completions/{task_id}.done` per task
//! - observed checkboxes: `- [x] [T###]` lines in a watched tasks file
//!
//! Markers are monotonic (never deleted by the orchestrator), so existence
//! checks need no locking. Observation failures never mask marker results.

use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};
use tracing::warn;

use crate::errors::{FlowError, Result};
use crate::paths;

/// Matches a completed checkbox line, ignoring leading whitespace:
/// `- [x] [T001] ...` or `- [X] [T001] ...`
static COMPLETED_TASK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*-\s+\[[xX]\]\s+\[(T\d{3})\]").unwrap());

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);

/// File-based completion detection for one repository.
#[derive(Debug, Clone)]
pub struct CompletionMonitor {
    completions_dir: PathBuf,
}

impl CompletionMonitor {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            completions_dir: paths::completions_dir(repo_root),
        }
    }

    fn marker_path(&self, task_id: &str) -> PathBuf {
        self.completions_dir.join(format!("{task_id}.done"))
    }

    /// Create the completion marker for a task. Idempotent, and safe under
    /// concurrent callers creating the same marker.
    pub fn mark_complete(&self, task_id: &str) -> Result<()> {
        fs::create_dir_all(&self.completions_dir)?;
        fs::File::create(self.marker_path(task_id))?;
        Ok(())
    }

    /// Whether a task's marker exists.
    pub fn is_complete(&self, task_id: &str) -> bool {
        self.marker_path(task_id).exists()
    }

    /// All task ids with completion markers.
    pub fn manual_completions(&self) -> BTreeSet<String> {
        let mut completed = BTreeSet::new();
        let Ok(entries) = fs::read_dir(&self.completions_dir) else {
            return completed;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("done")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                completed.insert(stem.to_string());
            }
        }
        completed
    }

    /// Union of marker completions and, when a readable tasks file is
    /// given, observed checkbox completions.
    pub fn completed_tasks(&self, tasks_file: Option<&Path>) -> BTreeSet<String> {
        let mut completed = self.manual_completions();
        if let Some(path) = tasks_file {
            match parse_completed_tasks(path) {
                Ok(observed) => completed.extend(observed),
                Err(e) => {
                    // Observation is best-effort; marker results stand alone.
                    warn!(path = %path.display(), error = %e, "tasks file unreadable");
                }
            }
        }
        completed
    }

    /// Block until every task in `task_ids` is completed on either channel.
    ///
    /// Polls every `poll_interval`. With a timeout, expiry raises
    /// [`FlowError::Timeout`] carrying both the completed and the pending
    /// subsets. An empty target set returns immediately.
    pub async fn wait_for(
        &self,
        task_ids: &BTreeSet<String>,
        tasks_file: Option<&Path>,
        timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> Result<BTreeSet<String>> {
        if task_ids.is_empty() {
            return Ok(BTreeSet::new());
        }

        let started = std::time::Instant::now();
        loop {
            let completed = self.completed_tasks(tasks_file);
            if task_ids.is_subset(&completed) {
                return Ok(task_ids.clone());
            }

            if let Some(limit) = timeout
                && started.elapsed() >= limit
            {
                let done: Vec<String> = task_ids.intersection(&completed).cloned().collect();
                let pending: Vec<String> = task_ids.difference(&completed).cloned().collect();
                return Err(FlowError::Timeout {
                    completed: done,
                    pending,
                });
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Extract completed task ids from a checkbox file.
pub fn parse_completed_tasks(path: &Path) -> Result<BTreeSet<String>> {
    if !path.exists() {
        return Err(FlowError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let content = fs::read_to_string(path)?;
    Ok(COMPLETED_TASK_REGEX
        .captures_iter(&content)
        .map(|caps| caps[1].to_string())
        .collect())
}

/// Watch a tasks file and report newly completed ids to `callback`.
///
/// Polls the file's modification time every `poll_interval` and coalesces
/// bursts of writes with `debounce`. Runs until the file disappears, which
/// ends the watch cleanly; single-revision parse failures are logged and
/// skipped. A rename counts as disappearance.
pub async fn watch_tasks_file<F>(
    path: &Path,
    mut callback: F,
    debounce: Duration,
    poll_interval: Duration,
) -> Result<()>
where
    F: FnMut(BTreeSet<String>) + Send,
{
    if !path.exists() {
        return Err(FlowError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut seen = parse_completed_tasks(path).unwrap_or_default();
    let mut last_mtime = modified(path);

    loop {
        tokio::time::sleep(poll_interval).await;

        if !path.exists() {
            return Ok(());
        }

        let mtime = modified(path);
        if mtime == last_mtime {
            continue;
        }
        last_mtime = mtime;

        // Let a burst of writes settle before reading.
        tokio::time::sleep(debounce).await;
        if !path.exists() {
            return Ok(());
        }
        last_mtime = modified(path);

        match parse_completed_tasks(path) {
            Ok(current) => {
                let newly: BTreeSet<String> = current.difference(&seen).cloned().collect();
                if !newly.is_empty() {
                    callback(newly);
                    seen = current;
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unparsable revision");
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn mark_and_check() {
        let dir = tempdir().unwrap();
        let monitor = CompletionMonitor::new(dir.path());

        assert!(!monitor.is_complete("T001"));
        monitor.mark_complete("T001").unwrap();
        assert!(monitor.is_complete("T001"));
        assert!(
            dir.path()
                .join(".speckit/completions/T001.done")
                .exists()
        );
    }

    #[test]
    fn mark_complete_is_idempotent() {
        let dir = tempdir().unwrap();
        let monitor = CompletionMonitor::new(dir.path());
        monitor.mark_complete("T001").unwrap();
        monitor.mark_complete("T001").unwrap();
        assert_eq!(monitor.manual_completions(), set(&["T001"]));
    }

    #[test]
    fn manual_completions_enumerates_markers() {
        let dir = tempdir().unwrap();
        let monitor = CompletionMonitor::new(dir.path());
        monitor.mark_complete("T001").unwrap();
        monitor.mark_complete("T003").unwrap();
        assert_eq!(monitor.manual_completions(), set(&["T001", "T003"]));
    }

    #[test]
    fn manual_completions_empty_without_directory() {
        let dir = tempdir().unwrap();
        let monitor = CompletionMonitor::new(dir.path());
        assert!(monitor.manual_completions().is_empty());
    }

    #[test]
    fn checkbox_parsing() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("tasks.md");
        fs::write(
            &file,
            "# Tasks\n\
             - [x] [T001] Setup database\n\
             - [ ] [T002] Build API\n\
             \t- [X] [T003] Indented and capital\n\
             - [x] T004 missing brackets\n\
             not a checkbox [x] [T005]\n",
        )
        .unwrap();

        assert_eq!(parse_completed_tasks(&file).unwrap(), set(&["T001", "T003"]));
    }

    #[test]
    fn unified_query_unions_both_channels() {
        let dir = tempdir().unwrap();
        let monitor = CompletionMonitor::new(dir.path());
        monitor.mark_complete("T001").unwrap();

        let file = dir.path().join("tasks.md");
        fs::write(&file, "- [x] [T002] From checkbox\n").unwrap();

        assert_eq!(
            monitor.completed_tasks(Some(&file)),
            set(&["T001", "T002"])
        );
    }

    #[test]
    fn unreadable_tasks_file_keeps_marker_results() {
        let dir = tempdir().unwrap();
        let monitor = CompletionMonitor::new(dir.path());
        monitor.mark_complete("T001").unwrap();

        let missing = dir.path().join("gone.md");
        assert_eq!(monitor.completed_tasks(Some(&missing)), set(&["T001"]));
    }

    #[tokio::test]
    async fn wait_for_empty_set_returns_immediately() {
        let dir = tempdir().unwrap();
        let monitor = CompletionMonitor::new(dir.path());
        let done = monitor
            .wait_for(&BTreeSet::new(), None, None, DEFAULT_POLL_INTERVAL)
            .await
            .unwrap();
        assert!(done.is_empty());
    }

    #[tokio::test]
    async fn wait_for_already_complete_returns_targets() {
        let dir = tempdir().unwrap();
        let monitor = CompletionMonitor::new(dir.path());
        monitor.mark_complete("T001").unwrap();
        monitor.mark_complete("T002").unwrap();

        let done = monitor
            .wait_for(
                &set(&["T001", "T002"]),
                None,
                Some(Duration::ZERO),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert_eq!(done, set(&["T001", "T002"]));
    }

    #[tokio::test]
    async fn wait_for_timeout_carries_partial_progress() {
        let dir = tempdir().unwrap();
        let monitor = CompletionMonitor::new(dir.path());
        monitor.mark_complete("T001").unwrap();

        let err = monitor
            .wait_for(
                &set(&["T001", "T002"]),
                None,
                Some(Duration::from_millis(30)),
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();

        match err {
            FlowError::Timeout { completed, pending } => {
                assert_eq!(completed, vec!["T001".to_string()]);
                assert_eq!(pending, vec!["T002".to_string()]);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_picks_up_markers_created_while_waiting() {
        let dir = tempdir().unwrap();
        let monitor = CompletionMonitor::new(dir.path());
        let marker = monitor.clone();

        let waiter = tokio::spawn(async move {
            monitor
                .wait_for(
                    &set(&["T001"]),
                    None,
                    Some(Duration::from_secs(5)),
                    Duration::from_millis(10),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        marker.mark_complete("T001").unwrap();

        let done = waiter.await.unwrap().unwrap();
        assert_eq!(done, set(&["T001"]));
    }

    #[tokio::test]
    async fn watcher_reports_newly_completed_only() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("tasks.md");
        fs::write(&file, "- [x] [T001] Done before watching\n- [ ] [T002] Pending\n").unwrap();

        let observed: Arc<Mutex<Vec<BTreeSet<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();

        let path = file.clone();
        let watcher = tokio::spawn(async move {
            watch_tasks_file(
                &path,
                move |newly| sink.lock().unwrap().push(newly),
                Duration::from_millis(20),
                Duration::from_millis(10),
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(&file, "- [x] [T001] Done\n- [x] [T002] Now done\n").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        fs::remove_file(&file).unwrap();
        watcher.await.unwrap().unwrap();

        let events = observed.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], set(&["T002"]));
    }

    #[tokio::test]
    async fn watcher_ends_cleanly_when_file_disappears() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("tasks.md");
        fs::write(&file, "- [ ] [T001] Pending\n").unwrap();

        let path = file.clone();
        let watcher = tokio::spawn(async move {
            watch_tasks_file(&path, |_| {}, Duration::from_millis(20), Duration::from_millis(10))
                .await
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        fs::remove_file(&file).unwrap();
        watcher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn watcher_requires_existing_file() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("tasks.md");
        let err = watch_tasks_file(
            &missing,
            |_| {},
            WATCH_DEBOUNCE,
            WATCH_POLL_INTERVAL,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FlowError::FileNotFound { .. }));
    }
}

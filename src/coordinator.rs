//! Session lifecycle coordination.
//!
//! The coordinator drives the whole orchestration: it materialises one
//! worktree per session, walks the DAG phase by phase, waits on the
//! completion monitor, persists state around every transition, and
//! checkpoints after each phase so a crash or Ctrl+C resumes where it
//! stopped.
//!
//! Execution is notification-mode: the agent adapter prompts the operator
//! to open each worktree, and completion comes back through marker files
//! or tasks.md checkboxes. The coordinator never spawns agents.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

use crate::agent::AgentAdapter;
use crate::completion::{CompletionMonitor, DEFAULT_POLL_INTERVAL};
use crate::config::FlowConfig;
use crate::dag::DagEngine;
use crate::errors::{FlowError, Result};
use crate::model::{SessionState, SessionStatus, TaskStatus};
use crate::paths;
use crate::state::{
    OrchestrationState, RecoveryManager, STATE_SCHEMA_VERSION, StateStore, TaskStateRecord,
    now_timestamp, parse_phase_index,
};
use crate::worktree::WorktreeManager;

/// How a full orchestration run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every phase completed
    Completed,
    /// Stopped cooperatively on SIGINT/SIGTERM; state is saved for resume
    Interrupted,
}

/// Cooperative cancellation flag shared between the signal listener and
/// the coordinator's wait loops.
///
/// The first signal sets the flag and wakes waiters; a second signal while
/// the flag is set exits the process immediately.
#[derive(Debug, Default)]
pub struct InterruptFlag {
    fired: AtomicBool,
    notify: Notify,
}

impl InterruptFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn trigger(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            // Second interrupt: stop cooperating.
            std::process::exit(130);
        }
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Complete once the flag is set.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Aborts the signal listener task when the run scope ends, so handlers
/// never outlive the orchestration that installed them.
struct SignalGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn spawn_signal_listener(flag: Arc<InterruptFlag>) -> SignalGuard {
    let handle = tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    loop {
                        if tokio::signal::ctrl_c().await.is_err() {
                            return;
                        }
                        flag.trigger();
                    }
                }
            };
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => flag.trigger(),
                    _ = sigterm.recv() => flag.trigger(),
                }
            }
        }
        #[cfg(not(unix))]
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            flag.trigger();
        }
    });
    SignalGuard { handle }
}

/// Coordinates parallel sessions across the DAG's phases.
pub struct SessionCoordinator {
    dag: DagEngine,
    config: FlowConfig,
    adapter: Box<dyn AgentAdapter>,
    repo_root: PathBuf,
    spec_id: String,
    base_branch: String,
    store: StateStore,
    worktrees: WorktreeManager,
    recovery: RecoveryManager,
    monitor: CompletionMonitor,
    interrupt: Arc<InterruptFlag>,
    poll_interval: Duration,
}

impl SessionCoordinator {
    pub fn new(
        dag: DagEngine,
        config: FlowConfig,
        adapter: Box<dyn AgentAdapter>,
        repo_root: &Path,
        spec_id: &str,
        base_branch: Option<String>,
    ) -> Self {
        Self {
            dag,
            config,
            adapter,
            repo_root: repo_root.to_path_buf(),
            spec_id: spec_id.to_string(),
            base_branch: base_branch.unwrap_or_else(|| "main".to_string()),
            store: StateStore::new(repo_root),
            worktrees: WorktreeManager::new(repo_root),
            recovery: RecoveryManager::new(repo_root),
            monitor: CompletionMonitor::new(repo_root),
            interrupt: InterruptFlag::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Shared cancellation flag, for wiring external signal sources.
    pub fn interrupt_flag(&self) -> Arc<InterruptFlag> {
        self.interrupt.clone()
    }

    /// Shrink the completion poll interval (tests).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn dag(&self) -> &DagEngine {
        &self.dag
    }

    /// Create worktrees, set up agent context, and persist the initial
    /// orchestration state.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.store.exists() {
            return Err(FlowError::StateAlreadyExists);
        }

        self.dag.assign_sessions(self.config.num_sessions)?;
        let now = now_timestamp();

        let mut sessions: Vec<SessionState> = Vec::new();
        for session_id in 0..self.config.num_sessions {
            let session_tasks = self.dag.session_tasks(session_id);
            // More sessions than tasks leaves trailing sessions empty.
            let Some(first_task) = session_tasks.first() else {
                continue;
            };
            let first_task = (*first_task).clone();

            let worktree_path = self
                .worktrees
                .create(&self.spec_id, session_id, &first_task.name)
                .await?;
            self.adapter.setup_session(&worktree_path, &first_task)?;

            let relative = worktree_path
                .strip_prefix(&self.repo_root)
                .unwrap_or(&worktree_path)
                .to_string_lossy()
                .to_string();
            sessions.push(SessionState::new(
                session_id,
                &relative,
                &paths::session_branch(&self.spec_id, session_id),
            ));
        }

        let mut tasks = BTreeMap::new();
        for task in self.dag.tasks() {
            tasks.insert(task.id.clone(), TaskStateRecord::pending(task.session));
        }

        let mut state = OrchestrationState {
            version: STATE_SCHEMA_VERSION.to_string(),
            spec_id: self.spec_id.clone(),
            agent_type: self.config.agent_type.clone(),
            num_sessions: self.config.num_sessions,
            base_branch: self.base_branch.clone(),
            started_at: now.clone(),
            updated_at: now,
            current_phase: "phase-0".to_string(),
            phases_completed: Vec::new(),
            sessions,
            tasks,
            merge_status: None,
        };
        self.store.save(&mut state)?;
        Ok(())
    }

    /// Execute one phase: mark its tasks in progress, prompt the operator
    /// per session, block until every task signals completion, then record
    /// the phase as done.
    pub async fn run_phase(&mut self, phase_idx: usize) -> Result<()> {
        let phases = self.dag.get_phases();
        if phase_idx >= phases.len() {
            return Err(FlowError::InvalidArgument(format!(
                "phase index {phase_idx} out of range (0-{})",
                phases.len().saturating_sub(1)
            )));
        }

        let phase_task_ids = &phases[phase_idx];
        let phase_name = format!("phase-{phase_idx}");

        println!();
        println!(
            "{} ({} tasks)",
            console::style(format!("Starting {phase_name}")).cyan().bold(),
            phase_task_ids.len()
        );

        let mut state = self.store.load()?;
        state.current_phase = phase_name.clone();
        self.store.save(&mut state)?;

        // Group the phase's tasks by assigned session, ascending.
        let mut session_tasks: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for task_id in phase_task_ids {
            let Some(task) = self.dag.get_task(task_id) else {
                continue;
            };
            session_tasks
                .entry(task.session.unwrap_or(0))
                .or_default()
                .push(task_id.clone());
        }

        let now = now_timestamp();
        for (&session_id, task_ids) in &session_tasks {
            for task_id in task_ids {
                if let Some(record) = state.tasks.get_mut(task_id) {
                    record.status = TaskStatus::InProgress;
                    record.started_at = Some(now.clone());
                }
            }

            let first_task_id = &task_ids[0];
            let Some(session_state) = state.session_mut(session_id) else {
                warn!(session_id, "no session record; skipping notification");
                continue;
            };
            session_state.status = SessionStatus::Executing;
            session_state.current_task = Some(first_task_id.clone());
            let worktree_abs = self.repo_root.join(&session_state.worktree_path);

            let Some(first_task) = self.dag.get_task(first_task_id) else {
                continue;
            };
            // Operator prompts are best-effort; state carries the truth.
            if let Err(e) = self.adapter.notify_user(session_id, &worktree_abs, first_task) {
                warn!(session_id, error = %e, "notify failed");
            }
        }

        self.store.save(&mut state)?;

        let tasks_file = paths::resolve_tasks_file(&self.repo_root, &self.base_branch).await;
        let targets: BTreeSet<String> = phase_task_ids.iter().cloned().collect();

        println!("{}", console::style("Waiting for tasks to complete...").cyan());
        println!(
            "{}",
            console::style("Mark tasks complete in tasks.md or run: skf complete TASK_ID").dim()
        );

        let wait = self.monitor.wait_for(
            &targets,
            tasks_file.as_deref(),
            None,
            self.poll_interval,
        );
        let completed = tokio::select! {
            result = wait => result,
            _ = self.interrupt.wait() => Err(FlowError::Interrupted),
        };

        match completed {
            Ok(done) => {
                println!();
                println!(
                    "{} Phase {phase_idx} complete ({} tasks)",
                    console::style("ok").green().bold(),
                    done.len()
                );
            }
            Err(e) => {
                // Interrupt or timeout: flush state before propagating so
                // the last save is the recovery point.
                self.store.save(&mut state)?;
                return Err(e);
            }
        }

        let completion_time = now_timestamp();
        for task_id in phase_task_ids {
            if let Some(record) = state.tasks.get_mut(task_id) {
                record.status = TaskStatus::Completed;
                record.completed_at = Some(completion_time.clone());
            }
        }

        for (&session_id, task_ids) in &session_tasks {
            if let Some(session_state) = state.session_mut(session_id) {
                session_state.completed_tasks.extend(task_ids.iter().cloned());
                session_state.status = SessionStatus::Idle;
                session_state.current_task = None;
            }
        }

        if !state.phases_completed.contains(&phase_name) {
            state.phases_completed.push(phase_name);
        }
        self.store.save(&mut state)?;
        Ok(())
    }

    /// Snapshot the live state into a checkpoint file, keeping the ring of
    /// retained checkpoints bounded.
    pub fn checkpoint_phase(&self) -> Result<PathBuf> {
        let state = self.store.load()?;
        let path = self.recovery.checkpoint(&state)?;
        self.recovery
            .cleanup_old(crate::state::DEFAULT_CHECKPOINTS_KEPT)?;
        println!(
            "{}",
            console::style(format!(
                "Checkpoint saved: {}",
                path.file_name().unwrap_or_default().to_string_lossy()
            ))
            .dim()
        );
        Ok(path)
    }

    /// Full orchestration: initialise (or resume), execute the remaining
    /// phases with a checkpoint after each, and finish by marking every
    /// session complete.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let _signals = spawn_signal_listener(self.interrupt.clone());

        let start_phase = if self.store.exists() {
            // Assignment is deterministic, so recomputing it on resume
            // reproduces the distribution the initial run persisted.
            self.dag.assign_sessions(self.config.num_sessions)?;

            let state = self.store.load()?;
            println!();
            println!(
                "{} Resuming orchestration from {}",
                console::style("!").yellow(),
                state.current_phase
            );

            let current_idx = parse_phase_index(&state.current_phase).ok_or_else(|| {
                FlowError::CorruptState {
                    field: "current_phase".to_string(),
                }
            })?;
            if state.phases_completed.contains(&state.current_phase) {
                current_idx + 1
            } else {
                current_idx
            }
        } else {
            println!();
            println!("{}", console::style("Initializing orchestration...").cyan().bold());
            self.initialize().await?;
            println!("{} Orchestration initialized", console::style("ok").green());
            0
        };

        let total_phases = self.dag.phase_count();
        println!();
        println!(
            "{} {total_phases} phases, {} tasks total",
            console::style("Orchestration plan:").bold(),
            self.dag.task_count()
        );

        for phase_idx in start_phase..total_phases {
            if self.interrupt.is_set() {
                break;
            }

            match self.run_phase(phase_idx).await {
                Ok(()) => {
                    self.checkpoint_phase()?;
                }
                Err(FlowError::Interrupted) => break,
                Err(e) => return Err(e),
            }
        }

        if self.interrupt.is_set() {
            println!();
            println!(
                "{} Orchestration interrupted. State saved; run again to resume",
                console::style("!").yellow()
            );
            return Ok(RunOutcome::Interrupted);
        }

        if start_phase < total_phases {
            let mut state = self.store.load()?;
            for session in &mut state.sessions {
                session.status = SessionStatus::Completed;
                session.current_task = None;
            }
            self.store.save(&mut state)?;
            self.checkpoint_phase()?;

            println!();
            println!("{}", console::style("Orchestration complete").green().bold());
            println!("  Total tasks: {}", state.tasks.len());
            println!("  Next: review session worktrees, then run skf merge");
        }

        Ok(RunOutcome::Completed)
    }

    /// Tear down the orchestration: delete state, force-remove this spec's
    /// worktrees. Session branches and checkpoints are left in place.
    /// Idempotent.
    pub async fn abort(&self) -> Result<usize> {
        self.store.delete()?;
        Ok(self.worktrees.cleanup_spec(&self.spec_id).await)
    }
}

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use skflow::agent::resolve_adapter;
use skflow::completion::CompletionMonitor;
use skflow::config::FlowConfig;
use skflow::coordinator::{RunOutcome, SessionCoordinator};
use skflow::dag::{DagDocument, DagEngine};
use skflow::errors::FlowError;
use skflow::git::Git;
use skflow::model::{TaskInfo, is_task_id};
use skflow::paths;
use skflow::state::{MergeStatus, StateStore};
use skflow::worktree::MergeOrchestrator;

#[derive(Parser)]
#[command(name = "skf")]
#[command(version, about = "Parallel AI-session orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository to operate on (defaults to the one containing the cwd)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    /// Spec identifier (defaults to the current branch name)
    #[arg(long, global = true)]
    pub spec: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the dependency DAG and write specs/{branch}/dag.yaml
    Dag {
        /// Override the configured session count
        #[arg(long)]
        sessions: Option<usize>,
    },
    /// Create session worktrees and the initial orchestration state
    Init,
    /// Run (or resume) the full orchestration
    Run {
        #[arg(long)]
        sessions: Option<usize>,
        /// Agent adapter to use (overrides config)
        #[arg(long)]
        agent: Option<String>,
    },
    /// Mark a task complete via its marker file
    Complete { task_id: String },
    /// Show orchestration progress
    Status,
    /// Analyse session branches and optionally merge them
    Merge {
        /// Perform the sequential merge after analysis
        #[arg(long)]
        execute: bool,
        /// Shell command to run on the integration branch after merging
        #[arg(long)]
        validate_cmd: Option<String>,
        /// Keep session worktrees after a successful merge
        #[arg(long)]
        keep_worktrees: bool,
        /// Base branch to merge from (defaults to the current branch)
        #[arg(long)]
        base: Option<String>,
    },
    /// Delete orchestration state and force-remove session worktrees
    Abort {
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let start_dir = match cli.repo.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let repo_root = paths::discover_repo_root(&start_dir).await?;
    let spec_id = match cli.spec.clone() {
        Some(spec) => spec,
        None => Git::new(&repo_root).current_branch().await?,
    };

    match &cli.command {
        Commands::Dag { sessions } => cmd_dag(&repo_root, &spec_id, *sessions).await?,
        Commands::Init => cmd_init(&repo_root, &spec_id, None, None, false).await?,
        Commands::Run { sessions, agent } => {
            cmd_init(&repo_root, &spec_id, *sessions, agent.clone(), true).await?;
        }
        Commands::Complete { task_id } => cmd_complete(&repo_root, task_id)?,
        Commands::Status => cmd_status(&repo_root)?,
        Commands::Merge {
            execute,
            validate_cmd,
            keep_worktrees,
            base,
        } => {
            cmd_merge(
                &repo_root,
                &spec_id,
                *execute,
                validate_cmd.as_deref(),
                *keep_worktrees,
                base.as_deref(),
            )
            .await?;
        }
        Commands::Abort { force } => cmd_abort(&repo_root, &spec_id, *force).await?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default_filter = if verbose { "skflow=debug" } else { "skflow=warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Load the task list for a spec: prefer the generated dag.yaml, fall back
/// to the plain tasks.yaml list.
fn load_tasks(repo_root: &std::path::Path, spec_id: &str) -> Result<Vec<TaskInfo>> {
    let dag_path = paths::dag_file(repo_root, spec_id);
    if dag_path.exists() {
        return Ok(DagDocument::load(&dag_path)?.into_tasks());
    }

    let list_path = paths::task_list_file(repo_root, spec_id);
    if !list_path.exists() {
        bail!(
            "No task list found for spec '{spec_id}'. Expected {} or {}",
            dag_path.display(),
            list_path.display()
        );
    }

    #[derive(serde::Deserialize)]
    struct TaskListDoc {
        tasks: Vec<TaskInfo>,
    }
    let content = std::fs::read_to_string(&list_path)?;
    let doc: TaskListDoc = serde_yaml::from_str(&content)
        .with_context(|| format!("Invalid task list: {}", list_path.display()))?;
    Ok(doc.tasks)
}

async fn cmd_dag(
    repo_root: &std::path::Path,
    spec_id: &str,
    sessions: Option<usize>,
) -> Result<()> {
    let config = FlowConfig::load_or_default(repo_root)?;
    let num_sessions = sessions.unwrap_or(config.num_sessions);

    let tasks = load_tasks(repo_root, spec_id)?;
    let mut engine = DagEngine::new(tasks)?;
    engine.validate()?;
    engine.assign_sessions(num_sessions)?;

    let phases = engine.get_phases();
    println!(
        "{} {} tasks in {} phases, {} sessions",
        console::style("DAG:").bold(),
        engine.task_count(),
        phases.len(),
        num_sessions
    );
    for (idx, phase) in phases.iter().enumerate() {
        println!("  phase-{idx}: {}", phase.join(", "));
    }
    let critical = engine.critical_path();
    println!(
        "  {} {}",
        console::style("critical path:").dim(),
        critical.join(" -> ")
    );

    let document = DagDocument::from_engine(&engine, spec_id, num_sessions);
    let dag_path = paths::dag_file(repo_root, spec_id);
    document.save(&dag_path)?;
    println!("{} Wrote {}", console::style("ok").green(), dag_path.display());
    Ok(())
}

/// Shared setup for `init` and `run`: build the coordinator, then either
/// initialise only or drive the full orchestration.
async fn cmd_init(
    repo_root: &std::path::Path,
    spec_id: &str,
    sessions: Option<usize>,
    agent: Option<String>,
    run: bool,
) -> Result<()> {
    let mut config = FlowConfig::load_or_default(repo_root)?;
    if let Some(sessions) = sessions {
        config.num_sessions = sessions;
    }
    if let Some(agent) = agent {
        config.agent_type = agent;
    }
    config.validate()?;

    let tasks = load_tasks(repo_root, spec_id)?;
    let engine = DagEngine::new(tasks)?;
    let adapter = resolve_adapter(&config.agent_type)?;
    let base_branch = Git::new(repo_root).current_branch().await?;

    let mut coordinator = SessionCoordinator::new(
        engine,
        config,
        adapter,
        repo_root,
        spec_id,
        Some(base_branch),
    );

    if run {
        match coordinator.run().await? {
            RunOutcome::Completed => {}
            RunOutcome::Interrupted => {
                // Clean interrupted-resume-needed exit.
            }
        }
    } else {
        coordinator.initialize().await?;
        println!(
            "{} Initialized orchestration for spec '{spec_id}'",
            console::style("ok").green()
        );
    }
    Ok(())
}

fn cmd_complete(repo_root: &std::path::Path, task_id: &str) -> Result<()> {
    if !is_task_id(task_id) {
        return Err(FlowError::InvalidTaskFormat {
            message: format!("'{task_id}' is not a task id (expected T###)"),
        }
        .into());
    }
    CompletionMonitor::new(repo_root).mark_complete(task_id)?;
    println!("{} Marked {task_id} complete", console::style("ok").green());
    Ok(())
}

fn cmd_status(repo_root: &std::path::Path) -> Result<()> {
    let state = StateStore::new(repo_root).load()?;

    println!("{}", console::style(format!("Spec: {}", state.spec_id)).bold());
    println!(
        "  agent: {}  sessions: {}  base: {}",
        state.agent_type, state.num_sessions, state.base_branch
    );
    println!(
        "  phase: {}  completed: [{}]",
        state.current_phase,
        state.phases_completed.join(", ")
    );
    if let Some(merge_status) = state.merge_status {
        println!("  merge: {merge_status:?}");
    }

    println!();
    for session in &state.sessions {
        let current = session.current_task.as_deref().unwrap_or("-");
        println!(
            "  session {}: {:?}  current: {}  done: {}",
            session.session_id,
            session.status,
            current,
            session.completed_tasks.len()
        );
    }

    println!();
    let mut by_status: std::collections::BTreeMap<String, usize> = Default::default();
    for record in state.tasks.values() {
        *by_status
            .entry(format!("{:?}", record.status).to_lowercase())
            .or_default() += 1;
    }
    let summary: Vec<String> = by_status
        .iter()
        .map(|(status, count)| format!("{count} {status}"))
        .collect();
    println!("  tasks: {}", summary.join(", "));
    Ok(())
}

async fn cmd_merge(
    repo_root: &std::path::Path,
    spec_id: &str,
    execute: bool,
    validate_cmd: Option<&str>,
    keep_worktrees: bool,
    base: Option<&str>,
) -> Result<()> {
    let orchestrator = MergeOrchestrator::new(spec_id, repo_root);

    let analysis = orchestrator.analyze(base).await?;
    println!(
        "{} base: {}, {} files changed across {} sessions",
        console::style("Merge analysis:").bold(),
        analysis.base_branch,
        analysis.total_files_changed(),
        analysis.session_changes.len()
    );
    for changes in &analysis.session_changes {
        println!(
            "  session {}: +{} ~{} -{}",
            changes.session_id,
            changes.added_files.len(),
            changes.modified_files.len(),
            changes.deleted_files.len()
        );
    }

    if analysis.safe_to_merge() {
        println!("{} No overlapping files", console::style("ok").green());
    } else {
        println!(
            "{} {} overlapping file(s):",
            console::style("!").yellow(),
            analysis.overlapping_files.len()
        );
        for (file, sessions) in &analysis.overlapping_files {
            println!("    {file} touched by sessions {sessions:?}");
        }
    }

    if !execute {
        println!(
            "{}",
            console::style("Analysis only; pass --execute to merge").dim()
        );
        return Ok(());
    }

    let store = StateStore::new(repo_root);
    set_merge_status(&store, MergeStatus::InProgress);

    let report = match orchestrator.merge_sequential(base).await {
        Ok(report) => report,
        Err(e) => {
            set_merge_status(&store, MergeStatus::Failed);
            return Err(e.into());
        }
    };

    if !report.success {
        set_merge_status(&store, MergeStatus::Failed);
        return Err(FlowError::MergeConflict {
            session: report.conflict_session.unwrap_or_default(),
            files: report.conflicting_files,
        }
        .into());
    }

    println!(
        "{} Merged sessions {:?} into {}",
        console::style("ok").green(),
        report.merged_sessions,
        report.integration_branch
    );

    if validate_cmd.is_some() {
        let (ok, output) = orchestrator.validate(validate_cmd).await?;
        if ok {
            println!("{} Validation passed", console::style("ok").green());
        } else {
            set_merge_status(&store, MergeStatus::Failed);
            bail!("Validation failed:\n{output}");
        }
    }

    let summary = orchestrator.finalize(keep_worktrees).await?;
    set_merge_status(&store, MergeStatus::Completed);
    println!(
        "{} {} files changed (+{} -{}), {} worktrees removed",
        console::style("Integration:").bold(),
        summary.files_changed,
        summary.lines_added,
        summary.lines_deleted,
        summary.worktrees_removed
    );
    Ok(())
}

/// Record merge progress in the live state when one exists; merging is
/// still possible after the state has been aborted away.
fn set_merge_status(store: &StateStore, status: MergeStatus) {
    if let Ok(mut state) = store.load() {
        state.merge_status = Some(status);
        if let Err(e) = store.save(&mut state) {
            tracing::warn!(error = %e, "could not record merge status");
        }
    }
}

async fn cmd_abort(repo_root: &std::path::Path, spec_id: &str, force: bool) -> Result<()> {
    if !force {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!(
                "Delete orchestration state and worktrees for spec '{spec_id}'?"
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted nothing.");
            return Ok(());
        }
    }

    StateStore::new(repo_root).delete()?;
    let removed = skflow::worktree::WorktreeManager::new(repo_root)
        .cleanup_spec(spec_id)
        .await;
    println!(
        "{} Removed state and {removed} worktree(s); session branches kept",
        console::style("ok").green()
    );
    Ok(())
}

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

use codebot_core::naming::{
    is_automation_branch, parse_pr_url, parse_repo_url, DEFAULT_BRANCH_PREFIX,
};
use codebot_core::store::{EventStore, SqliteStore};
use codebot_core::{Task, TaskResult, TaskStatus};

/// codebot: operator commands against the review follow-up state database
#[derive(Parser, Debug)]
#[command(name = "codebot")]
#[command(about = "Inspect and manage codebot state", long_about = None)]
struct Cli {
    /// Directory holding codebot-state.db
    #[arg(long, env = "STATE_DIR", default_value = ".", global = true)]
    state_dir: PathBuf,

    /// Log at info level instead of warnings only
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List tasks ordered by submission time
    Tasks(TasksArgs),
    /// Queue a new task for the server's task runner
    Submit(SubmitArgs),
    /// Record a pull request that already awaits review
    Track(TrackArgs),
    /// Forget every poll cursor so PRs are polled from scratch
    ResetCursors,
    /// Delete processed-event keys older than the retention window
    Prune(PruneArgs),
}

#[derive(Parser, Debug)]
struct TasksArgs {
    /// Only show tasks in this status (e.g. pending_review)
    #[arg(long)]
    status: Option<TaskStatus>,

    #[arg(long, default_value_t = 50)]
    limit: usize,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// https://github.com/<owner>/<repo>[.git]
    #[arg(long)]
    repo_url: String,

    /// What the agent should do; the first line becomes the PR title
    #[arg(long)]
    description: String,
}

#[derive(Parser, Debug)]
struct TrackArgs {
    /// Clone URL of the repository
    #[arg(long)]
    repo_url: String,

    /// https://github.com/<owner>/<repo>/pull/<n>
    #[arg(long)]
    pr_url: String,

    /// Head branch of the pull request
    #[arg(long)]
    branch: String,

    #[arg(long, default_value = "Tracked pull request")]
    description: String,

    /// Branch prefix that carries the workspace id
    #[arg(long, env = "CODEBOT_BRANCH_PREFIX", default_value = DEFAULT_BRANCH_PREFIX)]
    branch_prefix: String,
}

#[derive(Parser, Debug)]
struct PruneArgs {
    /// Keys processed longer ago than this many seconds are deleted
    #[arg(long, default_value_t = 604_800)]
    retention_secs: i64,
}

async fn run_tasks(store: &dyn EventStore, args: TasksArgs) -> Result<()> {
    let tasks = store.list_tasks(args.status, args.limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!("{:<36}  {:<14}  {:<20}  PR", "ID", "STATUS", "SUBMITTED");
    for task in &tasks {
        println!(
            "{:<36}  {:<14}  {:<20}  {}",
            task.id,
            task.status,
            task.submitted_at.format("%Y-%m-%d %H:%M:%S"),
            task.pr_url().unwrap_or("-")
        );
    }
    Ok(())
}

fn submitted_task(args: &SubmitArgs) -> Result<Task> {
    if args.description.trim().is_empty() {
        bail!("--description must not be empty");
    }
    if parse_repo_url(&args.repo_url).is_none() {
        bail!(
            "'{}' is not a repository URL (expected https://github.com/<owner>/<repo>)",
            args.repo_url
        );
    }
    Ok(Task::new(&args.description, &args.repo_url, Utc::now()))
}

async fn run_submit(store: &dyn EventStore, args: SubmitArgs) -> Result<()> {
    let task = submitted_task(&args)?;
    store.put_task(&task).await?;
    println!("Submitted task {}", task.id);
    Ok(())
}

fn tracked_task(args: &TrackArgs) -> Result<Task> {
    if parse_pr_url(&args.pr_url).is_none() {
        bail!(
            "'{}' is not a pull request URL (expected https://github.com/<owner>/<repo>/pull/<n>)",
            args.pr_url
        );
    }
    if !is_automation_branch(&args.branch, &args.branch_prefix) {
        bail!(
            "branch '{}' is not under the automation prefix '{}'",
            args.branch,
            args.branch_prefix
        );
    }

    Ok(Task::awaiting_review(
        &args.description,
        &args.repo_url,
        TaskResult::new(&args.pr_url, &args.branch),
        Utc::now(),
    ))
}

async fn run_track(store: &dyn EventStore, args: TrackArgs) -> Result<()> {
    if let Some(existing) = store.find_task_by_pr_url(&args.pr_url).await? {
        bail!(
            "{} is already tracked by task {} ({})",
            args.pr_url,
            existing.id,
            existing.status
        );
    }

    let task = tracked_task(&args)?;
    store.put_task(&task).await?;
    println!("Tracking {} as task {}", args.pr_url, task.id);
    Ok(())
}

async fn run_reset_cursors(store: &dyn EventStore) -> Result<()> {
    let cleared = store.clear_cursors().await?;
    println!("Cleared {} poll cursor(s).", cleared);
    Ok(())
}

fn prune_cutoff(now: DateTime<Utc>, retention_secs: i64) -> Result<DateTime<Utc>> {
    if retention_secs < 0 {
        bail!("--retention-secs must not be negative");
    }
    chrono::Duration::try_seconds(retention_secs)
        .and_then(|retention| now.checked_sub_signed(retention))
        .with_context(|| format!("--retention-secs {} is out of range", retention_secs))
}

async fn run_prune(store: &dyn EventStore, args: PruneArgs) -> Result<()> {
    let cutoff = prune_cutoff(Utc::now(), args.retention_secs)?;
    let removed = store.prune_processed(cutoff).await?;
    println!("Removed {} processed-event key(s) older than {}.", removed, cutoff);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::INFO } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let store = SqliteStore::open_in_dir(&cli.state_dir).with_context(|| {
        format!(
            "Failed to open state database in {}",
            cli.state_dir.display()
        )
    })?;

    match cli.command {
        Commands::Tasks(args) => run_tasks(&store, args).await,
        Commands::Submit(args) => run_submit(&store, args).await,
        Commands::Track(args) => run_track(&store, args).await,
        Commands::ResetCursors => run_reset_cursors(&store).await,
        Commands::Prune(args) => run_prune(&store, args).await,
    }
}

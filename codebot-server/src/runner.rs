//! Executes submitted automation tasks.
//!
//! A pending task gets a fresh workspace on a new automation branch, one
//! agent session, a push and a PR. From then on the poller and the webhook
//! own it. A task that fails before its PR exists is marked `failed` and
//! its workspace is left on disk for inspection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use codebot_core::naming::{branch_name, generate_workspace_id, parse_repo_url, slugify};
use codebot_core::store::EventStore;
use codebot_core::{Task, TaskResult, TaskStatus};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::CodeAgent;
use crate::git::{strip_co_author_trailers, GitProvider};
use crate::github::ReviewPlatform;
use crate::prompt::TASK_DESCRIPTION_HEADING;
use crate::workspace::WorkspaceResolver;

/// Pending tasks picked up per tick.
const MAX_TASKS_PER_TICK: usize = 10;

const SLUG_LEN: usize = 40;
const COMMIT_SUMMARY_LEN: usize = 100;
const TITLE_LEN: usize = 100;

const PR_FOOTER: &str = "*This PR was automatically generated by codebot 🤖*";

pub struct TaskRunner {
    store: Arc<dyn EventStore>,
    platform: Arc<dyn ReviewPlatform>,
    git: Arc<dyn GitProvider>,
    agent: Arc<dyn CodeAgent>,
    workspaces: Arc<WorkspaceResolver>,
    branch_prefix: String,
    interval: Duration,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn EventStore>,
        platform: Arc<dyn ReviewPlatform>,
        git: Arc<dyn GitProvider>,
        agent: Arc<dyn CodeAgent>,
        workspaces: Arc<WorkspaceResolver>,
        branch_prefix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            platform,
            git,
            agent,
            workspaces,
            branch_prefix: branch_prefix.into(),
            interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("Task runner started, interval {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let executed = self.run_pending().await;
            if executed > 0 {
                info!("Task runner executed {} task(s)", executed);
            }
        }

        info!("Task runner stopped");
    }

    /// Execute the oldest pending tasks, one at a time. Returns how many
    /// were attempted.
    pub async fn run_pending(&self) -> usize {
        let tasks = match self
            .store
            .list_tasks(Some(TaskStatus::Pending), MAX_TASKS_PER_TICK)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to list pending tasks: {}", e);
                return 0;
            }
        };

        let count = tasks.len();
        for task in tasks {
            if let Err(e) = self.execute(task).await {
                error!("Failed to record task outcome: {:#}", e);
            }
        }
        count
    }

    /// Drive one task from `pending` to `pending_review` or `failed`.
    ///
    /// Only store errors surface; everything else is recorded on the task.
    pub async fn execute(&self, mut task: Task) -> Result<Task> {
        task.start(Utc::now())?;
        self.store.put_task(&task).await?;
        info!("Running task {} on {}", task.id, task.repository_url);

        match self.open_pull_request(&task).await {
            Ok(result) => {
                info!("Task {} opened {}", task.id, result.pr_url);
                task.open_pr(result)?;
            }
            Err(e) => {
                error!("Task {} failed: {:#}", task.id, e);
                task.fail(format!("{:#}", e), Utc::now())?;
            }
        }

        self.store.put_task(&task).await?;
        Ok(task)
    }

    async fn open_pull_request(&self, task: &Task) -> Result<TaskResult> {
        let repo = parse_repo_url(&task.repository_url)
            .ok_or_else(|| anyhow!("unsupported repository url {}", task.repository_url))?;
        let summary = first_line(&task.description);
        let id = generate_workspace_id();
        let branch = branch_name(
            &self.branch_prefix,
            None,
            &id,
            &slugify(summary, SLUG_LEN),
        );

        let clone_url = self.platform.authenticated_clone_url(&repo).await?;
        let workspace = self.workspaces.create(&clone_url, &id, &branch).await?;

        self.commit_agent_changes(task, &workspace).await?;

        self.git
            .push(&workspace, &clone_url, &branch)
            .await
            .context("Failed to push task branch")?;

        let message = self
            .git
            .commit_message(&workspace, "HEAD")
            .await
            .unwrap_or_default();
        let pr_url = self
            .platform
            .create_pull_request(
                &repo,
                &branch,
                &pr_title(&task.description),
                &pr_body(&task.description, &message),
            )
            .await?;

        Ok(TaskResult::new(pr_url, branch))
    }

    async fn commit_agent_changes(&self, task: &Task, workspace: &Path) -> Result<()> {
        let before = self.git.current_commit_hash(workspace).await?;

        let outcome = self.agent.run(workspace, &task.description, "").await?;
        if !outcome.succeeded() {
            bail!("agent exited with code {}", outcome.exit_code);
        }

        if self.git.has_uncommitted_changes(workspace).await? {
            info!("Committing changes the agent left uncommitted");
            let message = truncate(first_line(&task.description), COMMIT_SUMMARY_LEN);
            self.git.commit(workspace, &message).await?;
        }

        let after = self.git.current_commit_hash(workspace).await?;
        if after == before {
            bail!("agent made no changes");
        }

        match self.git.remove_co_author_trailers(workspace).await {
            Ok(true) => debug!("Removed co-author trailers from HEAD"),
            Ok(false) => {}
            Err(e) => warn!("Could not clean commit message: {:#}", e),
        }
        Ok(())
    }
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn pr_title(description: &str) -> String {
    let line = first_line(description);
    if line.chars().count() > TITLE_LEN {
        format!("{}...", truncate(line, TITLE_LEN - 3))
    } else {
        line.to_string()
    }
}

fn pr_body(description: &str, commit_message: &str) -> String {
    format!(
        "{}\n\n{}\n\n## 🔨 Changes Made\n\n{}\n\n---\n{}",
        TASK_DESCRIPTION_HEADING,
        description.trim(),
        strip_co_author_trailers(commit_message).trim(),
        PR_FOOTER
    )
}

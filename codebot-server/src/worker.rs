//! Queue consumers.
//!
//! Each worker takes one event at a time and handles it end to end,
//! including the reply, before taking the next. Events of the same PR are
//! serialized through a per-PR lock so two workers never share a workspace.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use codebot_core::naming::is_automation_branch;
use codebot_core::thread::{reconstruct_thread, ThreadComment};
use codebot_core::{EventDetail, PrId, ReviewEvent};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::CodeAgent;
use crate::classifier::{Classifier, Intent};
use crate::git::GitProvider;
use crate::github::{format_changed_files, InlineComment, PrDetails, ReviewPlatform};
use crate::prompt::{
    description_prompt, extract_task_description, review_instructions, task_description,
    CommentLocation, PrContext, TASK_DESCRIPTION_HEADING,
};
use crate::queue::{QueueReceiver, Received, RECV_TIMEOUT};
use crate::reply;
use crate::workspace::WorkspaceResolver;

pub const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(60);

const FALLBACK_COMMIT_MESSAGE: &str = "Address review comment";

/// Handles one review event at a time per PR.
pub struct ReviewProcessor {
    platform: Arc<dyn ReviewPlatform>,
    git: Arc<dyn GitProvider>,
    agent: Arc<dyn CodeAgent>,
    classifier: Arc<dyn Classifier>,
    workspaces: Arc<WorkspaceResolver>,
    branch_prefix: String,
    pr_locks: RwLock<HashMap<PrId, Arc<Mutex<()>>>>,
}

impl ReviewProcessor {
    pub fn new(
        platform: Arc<dyn ReviewPlatform>,
        git: Arc<dyn GitProvider>,
        agent: Arc<dyn CodeAgent>,
        classifier: Arc<dyn Classifier>,
        workspaces: Arc<WorkspaceResolver>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            git,
            agent,
            classifier,
            workspaces,
            branch_prefix: branch_prefix.into(),
            pr_locks: RwLock::new(HashMap::new()),
        }
    }

    async fn get_or_create_pr_lock(&self, pr: &PrId) -> Arc<Mutex<()>> {
        {
            let locks = self.pr_locks.read().await;
            if let Some(lock) = locks.get(pr) {
                return lock.clone();
            }
        }

        let mut locks = self.pr_locks.write().await;
        locks
            .entry(pr.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the map entry for `pr` once nobody else holds or waits on it.
    async fn release_pr_lock(&self, pr: &PrId, lock: Arc<Mutex<()>>) {
        let mut locks = self.pr_locks.write().await;
        // Clones are only handed out under the map lock, so the count is
        // exact here: the map's entry plus `lock`.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(pr);
        }
    }

    /// Handle an event. Failures are logged and answered with an error
    /// reply; they never propagate to the caller.
    pub async fn process(&self, event: ReviewEvent) {
        let pr = event.pr_id();
        let key = event.dedup_key();

        let pr_lock = self.get_or_create_pr_lock(&pr).await;
        {
            let _guard = pr_lock.lock().await;

            info!("Processing {} on {}", key, pr);
            match self.handle(&event).await {
                Ok(()) => info!("Finished {}", key),
                Err(e) => {
                    error!("Failed to process {} on {}: {:#}", key, pr, e);
                    if let Err(e) = self.post_reply(&event, reply::ERROR_REPLY).await {
                        error!("Failed to post error reply for {}: {:#}", key, e);
                    }
                }
            }
        }
        self.release_pr_lock(&pr, pr_lock).await;
    }

    async fn handle(&self, event: &ReviewEvent) -> Result<()> {
        let pr = event.pr_id();

        let details = match self.platform.get_pr_details(&pr).await {
            Ok(details) => Some(details),
            Err(e) => {
                warn!("Could not fetch details of {}: {:#}", pr, e);
                None
            }
        };

        let branch = event
            .branch_name
            .clone()
            .or_else(|| details.as_ref().and_then(|d| d.head_ref()).map(str::to_string));
        let Some(branch) = branch else {
            warn!("Dropping {}: no branch name for {}", event.dedup_key(), pr);
            return Ok(());
        };
        if !is_automation_branch(&branch, &self.branch_prefix) {
            debug!("Dropping {}: {} is not an automation branch", event.dedup_key(), branch);
            return Ok(());
        }

        let clone_url = self
            .platform
            .authenticated_clone_url(&pr.repo)
            .await
            .context("Failed to get clone URL")?;
        let workspace = self
            .workspaces
            .resolve_or_provision(&clone_url, &branch, &pr)
            .await?;

        let context = self.build_context(event, details.as_ref()).await;
        let classification = self.classifier.classify(&event.body, &context).await;
        info!("{} classified as {:?}", event.dedup_key(), classification.intent);

        let text = match classification.intent {
            Intent::Ambiguous => reply::clarification(classification.clarification_question()),
            Intent::Appreciation => reply::APPRECIATION_REPLY.to_string(),
            Intent::Nitpick => {
                let analysis = self.classifier.analyze_nitpick(&event.body, &context).await;
                reply::nitpick(analysis.as_ref())
            }
            Intent::Query => self.answer_query(event, &context, &workspace).await?,
            Intent::ChangeRequest => {
                self.apply_change_request(
                    event,
                    &context,
                    &workspace,
                    &clone_url,
                    &branch,
                    details.as_ref(),
                )
                .await?
            }
        };

        self.post_reply(event, &text).await
    }

    async fn build_context(&self, event: &ReviewEvent, details: Option<&PrDetails>) -> PrContext {
        let pr = event.pr_id();
        let mut context = PrContext::default();

        if let Some(details) = details {
            context.title = details.title.clone();
            context.body = details.body.clone().unwrap_or_default();
        }

        match self.platform.list_changed_files(&pr).await {
            Ok(files) => context.files_changed = format_changed_files(&files),
            Err(e) => warn!("Could not list changed files of {}: {:#}", pr, e),
        }

        if let EventDetail::InlineComment {
            comment_id,
            path,
            line,
            diff_hunk,
            ..
        } = &event.detail
        {
            context.location = Some(CommentLocation {
                path: path.clone(),
                line: *line,
                diff_hunk: diff_hunk.clone(),
            });

            match self.platform.list_inline_comments(&pr, None).await {
                Ok(comments) => {
                    let all: Vec<ThreadComment> = comments.iter().map(thread_comment).collect();
                    let thread = reconstruct_thread(&all, *comment_id);
                    if thread.len() > 1 {
                        context.thread = thread
                            .into_iter()
                            .filter(|c| c.id != *comment_id)
                            .collect();
                    }
                }
                Err(e) => warn!("Could not load comment thread on {}: {:#}", pr, e),
            }
        }

        context
    }

    async fn answer_query(
        &self,
        event: &ReviewEvent,
        context: &PrContext,
        workspace: &Path,
    ) -> Result<String> {
        let outcome = self
            .agent
            .run(
                workspace,
                &task_description(&event.body, false),
                &review_instructions(&event.body, context, false),
            )
            .await?;
        if !outcome.succeeded() {
            bail!("agent exited with code {}", outcome.exit_code);
        }
        Ok(reply::agent_text_or(outcome.response(), || {
            reply::QUERY_FALLBACK_REPLY.to_string()
        }))
    }

    async fn apply_change_request(
        &self,
        event: &ReviewEvent,
        context: &PrContext,
        workspace: &Path,
        clone_url: &str,
        branch: &str,
        details: Option<&PrDetails>,
    ) -> Result<String> {
        let before = self.git.current_commit_hash(workspace).await?;

        let outcome = self
            .agent
            .run(
                workspace,
                &task_description(&event.body, true),
                &review_instructions(&event.body, context, true),
            )
            .await?;
        if !outcome.succeeded() {
            bail!("agent exited with code {}", outcome.exit_code);
        }

        if self.git.has_uncommitted_changes(workspace).await? {
            info!("Committing changes the agent left uncommitted");
            self.git.commit(workspace, FALLBACK_COMMIT_MESSAGE).await?;
        }

        let after = self.git.current_commit_hash(workspace).await?;
        if after == before {
            info!("No new commits for {}", event.dedup_key());
            return Ok(reply::agent_text_or(outcome.response(), || {
                reply::NO_CHANGES_REPLY.to_string()
            }));
        }

        match self.git.remove_co_author_trailers(workspace).await {
            Ok(true) => debug!("Removed co-author trailers from HEAD"),
            Ok(false) => {}
            Err(e) => warn!("Could not clean commit message: {:#}", e),
        }

        self.git
            .push(workspace, clone_url, branch)
            .await
            .context("Failed to push changes")?;

        let hash = self.git.current_commit_hash(workspace).await?;
        let message = self
            .git
            .commit_message(workspace, "HEAD")
            .await
            .unwrap_or_default();

        if let Some(details) = details {
            if let Err(e) = self.refresh_description(&event.pr_id(), details).await {
                warn!("Could not refresh description of {}: {:#}", event.pr_id(), e);
            }
        }

        Ok(reply::agent_text_or(outcome.response(), || {
            reply::commit_summary(&hash, message.lines().next().unwrap_or_default())
        }))
    }

    /// Regenerate the PR description after new commits.
    async fn refresh_description(&self, pr: &PrId, details: &PrDetails) -> Result<()> {
        let task = extract_task_description(details.body.as_deref().unwrap_or_default());
        if task.is_empty() {
            debug!("{} has no task description section, leaving it alone", pr);
            return Ok(());
        }

        let files: Vec<String> = self
            .platform
            .list_changed_files(pr)
            .await?
            .into_iter()
            .map(|f| f.filename)
            .collect();

        let generated = self
            .agent
            .ask(&description_prompt(&task, &files), DESCRIPTION_TIMEOUT)
            .await?;
        let body = reply::clean_description(&generated);
        if !body.contains(TASK_DESCRIPTION_HEADING) {
            bail!("generated description lacks the task heading");
        }

        self.platform
            .update_pr_description(pr, &details.title, &body)
            .await
    }

    /// Inline comments get a threaded reply; everything else a PR comment.
    async fn post_reply(&self, event: &ReviewEvent, body: &str) -> Result<()> {
        let pr = event.pr_id();
        match event.detail {
            EventDetail::InlineComment { comment_id, .. } => {
                self.platform.post_reply(&pr, comment_id, body).await
            }
            EventDetail::IssueComment { .. } | EventDetail::Review { .. } => {
                self.platform.post_issue_comment(&pr, body).await
            }
        }
    }
}

fn thread_comment(comment: &InlineComment) -> ThreadComment {
    ThreadComment {
        id: comment.id,
        in_reply_to: comment.in_reply_to_id,
        author: comment.user.login.clone(),
        body: comment.body.clone(),
        created_at: comment.created_at,
    }
}

/// Spawn `count` workers draining `receiver` until `cancel` fires or the
/// queue closes. An in-flight event is always finished.
pub fn spawn_workers(
    count: usize,
    processor: Arc<ReviewProcessor>,
    receiver: QueueReceiver,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|id| {
            let processor = processor.clone();
            let receiver = receiver.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { worker_loop(id, processor, receiver, cancel).await })
        })
        .collect()
}

async fn worker_loop(
    id: usize,
    processor: Arc<ReviewProcessor>,
    receiver: QueueReceiver,
    cancel: CancellationToken,
) {
    info!("Worker {} started", id);
    while !cancel.is_cancelled() {
        match receiver.recv_or_cancel(RECV_TIMEOUT, &cancel).await {
            Received::Event(event) => processor.process(event).await,
            Received::TimedOut => continue,
            Received::Closed | Received::Cancelled => break,
        }
    }
    info!("Worker {} stopped", id);
}

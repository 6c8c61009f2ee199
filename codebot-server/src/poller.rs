//! Pull-based ingestion.
//!
//! Every cycle walks the tasks awaiting review, reconciles each PR's
//! lifecycle, and pulls the comments and reviews newer than the PR's cursor
//! window into the dedup gate.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use codebot_core::cursor::{lower_bound, next_cursor, FetchOutcome};
use codebot_core::naming::parse_pr_url;
use codebot_core::store::EventStore;
use codebot_core::{PrId, Task, TaskStatus};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gate::{Admission, DedupGate};
use crate::github::ReviewPlatform;
use crate::ingest::{inline_event, issue_event, review_event};
use crate::lifecycle::LifecycleService;

/// Upper bound on tasks examined per cycle.
pub const MAX_TASKS_PER_CYCLE: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub prs_polled: usize,
    pub prs_closed: usize,
    pub prs_failed: usize,
    pub events_enqueued: usize,
}

/// What happened to one PR in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrPoll {
    Closed,
    Polled {
        enqueued: usize,
        /// Events the gate could neither enqueue nor dismiss.
        refused: usize,
        outcome: FetchOutcome,
        cursor_advanced: bool,
    },
}

pub struct Poller {
    store: Arc<dyn EventStore>,
    platform: Arc<dyn ReviewPlatform>,
    gate: Arc<DedupGate>,
    lifecycle: Arc<LifecycleService>,
    interval: Duration,
    retention: Duration,
}

impl Poller {
    pub fn new(
        store: Arc<dyn EventStore>,
        platform: Arc<dyn ReviewPlatform>,
        gate: Arc<DedupGate>,
        lifecycle: Arc<LifecycleService>,
        interval: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            platform,
            gate,
            lifecycle,
            interval,
            retention,
        }
    }

    /// Poll until `cancel` fires. A running cycle is always finished.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Poller started, interval {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = self.poll_cycle().await;
            info!(
                "Poll cycle done: {} polled, {} closed, {} failed, {} enqueued",
                report.prs_polled, report.prs_closed, report.prs_failed, report.events_enqueued
            );
        }

        info!("Poller stopped");
    }

    pub async fn poll_cycle(&self) -> CycleReport {
        let started_at = Utc::now();
        let mut report = CycleReport::default();

        self.prune(started_at).await;

        let tasks = match self
            .store
            .list_tasks(Some(TaskStatus::PendingReview), MAX_TASKS_PER_CYCLE)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to list tasks awaiting review: {}", e);
                return report;
            }
        };
        debug!("Polling {} tasks", tasks.len());

        for task in tasks {
            let Some(pr) = task.pr_url().and_then(parse_pr_url) else {
                warn!(
                    "Task {} has no parseable PR URL ({:?}), skipping",
                    task.id,
                    task.pr_url()
                );
                continue;
            };

            match self.poll_pr(task, &pr, started_at).await {
                Ok(PrPoll::Closed) => report.prs_closed += 1,
                Ok(PrPoll::Polled { enqueued, .. }) => {
                    report.prs_polled += 1;
                    report.events_enqueued += enqueued;
                }
                Err(e) => {
                    report.prs_failed += 1;
                    error!("Polling {} failed: {:#}", pr, e);
                }
            }
        }

        report
    }

    /// Reconcile and poll a single PR.
    pub async fn poll_pr(
        &self,
        task: Task,
        pr: &PrId,
        cycle_started_at: DateTime<Utc>,
    ) -> anyhow::Result<PrPoll> {
        let observed = self.platform.get_pr_state(pr).await?;
        let task = self.lifecycle.apply(task, observed).await?;
        if observed.is_closed() {
            info!("{} is closed, task {} is now {}", pr, task.id, task.status);
            return Ok(PrPoll::Closed);
        }

        let previous = self.store.get_cursor(pr).await?;
        let created_at = match previous {
            Some(_) => None,
            None => match self.platform.get_pr_details(pr).await {
                Ok(details) => details.created_at,
                Err(e) => {
                    warn!("No creation time for {}, using fallback window: {:#}", pr, e);
                    None
                }
            },
        };
        let since = lower_bound(previous, created_at, cycle_started_at);
        debug!("Polling {} since {}", pr, since);

        let branch = task.branch_name();
        let mut outcome = FetchOutcome::default();
        let mut events = Vec::new();

        let inline = self.platform.list_inline_comments(pr, Some(since)).await;
        outcome.record(&inline);
        match inline {
            Ok(comments) => events.extend(
                comments
                    .iter()
                    .filter(|c| c.created_at >= since)
                    .map(|c| inline_event(&pr.repo, pr.pr_number, branch, c)),
            ),
            Err(e) => error!("Fetching inline comments of {} failed: {:#}", pr, e),
        }

        let issue = self.platform.list_issue_comments(pr, Some(since)).await;
        outcome.record(&issue);
        match issue {
            Ok(comments) => events.extend(
                comments
                    .iter()
                    .filter(|c| c.created_at >= since)
                    .map(|c| issue_event(&pr.repo, pr.pr_number, branch, c)),
            ),
            Err(e) => error!("Fetching issue comments of {} failed: {:#}", pr, e),
        }

        let reviews = self.platform.list_reviews(pr).await;
        outcome.record(&reviews);
        match reviews {
            Ok(reviews) => events.extend(
                reviews
                    .iter()
                    .filter(|r| r.submitted_at.is_some_and(|at| at >= since))
                    .filter_map(|r| review_event(&pr.repo, pr.pr_number, branch, r)),
            ),
            Err(e) => error!("Fetching reviews of {} failed: {:#}", pr, e),
        }

        let mut enqueued = 0;
        let mut refused = 0;
        for event in events {
            match self.gate.submit(event).await {
                Admission::Enqueued => enqueued += 1,
                Admission::Failed => refused += 1,
                Admission::SelfAuthored | Admission::Duplicate => {}
            }
        }

        // An event that was fetched but never enqueued must stay inside the
        // next window, whatever the fetches did.
        let next = if refused > 0 {
            None
        } else {
            next_cursor(previous, cycle_started_at, outcome)
        };

        let cursor_advanced = match next {
            Some(to) => self.store.advance_cursor(pr, to).await?,
            None => {
                if refused > 0 {
                    warn!(
                        "Keeping cursor of {}: {} events could not be enqueued",
                        pr, refused
                    );
                } else if outcome.failed > 0 {
                    warn!(
                        "Keeping cursor of {} after {} failed fetches",
                        pr, outcome.failed
                    );
                }
                false
            }
        };

        Ok(PrPoll::Polled {
            enqueued,
            refused,
            outcome,
            cursor_advanced,
        })
    }

    async fn prune(&self, now: DateTime<Utc>) {
        let Some(cutoff) = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return;
        };
        match self.store.prune_processed(cutoff).await {
            Ok(0) => {}
            Ok(n) => info!("Pruned {} processed-event keys older than {}", n, cutoff),
            Err(e) => warn!("Pruning processed events failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{channel, QueueReceiver, Received};
    use crate::testing::{
        inline_comment, issue_comment, pr_details, review, FakeGit, FakePlatform,
    };
    use crate::workspace::WorkspaceResolver;
    use chrono::Duration as ChronoDuration;
    use codebot_core::store::InMemoryStore;
    use codebot_core::TaskResult;
    use tempfile::TempDir;

    const BRANCH: &str = "u/codebot/abc1234/add-retries";

    struct Harness {
        store: Arc<InMemoryStore>,
        platform: Arc<FakePlatform>,
        poller: Poller,
        rx: QueueReceiver,
        pr: PrId,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let platform = Arc::new(FakePlatform::new());
        let (tx, rx) = channel(64);
        let gate = Arc::new(DedupGate::new(store.clone(), tx, "codebot-007[bot]"));
        let workspaces = Arc::new(WorkspaceResolver::new(
            dir.path(),
            "u/codebot",
            Arc::new(FakeGit::new()),
        ));
        let lifecycle = Arc::new(LifecycleService::new(store.clone(), workspaces));
        let poller = Poller::new(
            store.clone(),
            platform.clone(),
            gate,
            lifecycle,
            Duration::from_secs(300),
            Duration::from_secs(7 * 24 * 3600),
        );
        Harness {
            store,
            platform,
            poller,
            rx,
            pr: PrId::new("acme", "widgets", 42),
            _dir: dir,
        }
    }

    fn task() -> Task {
        Task::awaiting_review(
            "add retries",
            "https://github.com/acme/widgets.git",
            TaskResult::new("https://github.com/acme/widgets/pull/42", BRANCH),
            Utc::now() - ChronoDuration::hours(2),
        )
    }

    async fn drain(rx: &QueueReceiver) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Received::Event(e) = rx.recv_timeout(Duration::from_millis(10)).await {
            ids.push(e.source_id());
        }
        ids
    }

    #[tokio::test]
    async fn test_first_poll_uses_creation_time_and_initializes_cursor() {
        let h = harness();
        let created = Utc::now() - ChronoDuration::hours(1);
        h.platform
            .set_details(&h.pr, pr_details("open", false, BRANCH, created));
        h.store.put_task(&task()).await.unwrap();

        let report = h.poller.poll_cycle().await;
        assert_eq!(report.prs_polled, 1);

        let since = h.platform.since_seen.lock().unwrap()[0].1;
        assert_eq!(since, Some(created - ChronoDuration::seconds(60)));
        assert!(h.store.get_cursor(&h.pr).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_subsequent_poll_overlaps_previous_cursor() {
        let h = harness();
        h.platform
            .set_details(&h.pr, pr_details("open", false, BRANCH, Utc::now()));
        let cursor = Utc::now() - ChronoDuration::minutes(5);
        h.store.advance_cursor(&h.pr, cursor).await.unwrap();

        let started = Utc::now();
        h.poller.poll_pr(task(), &h.pr, started).await.unwrap();

        let since = h.platform.since_seen.lock().unwrap()[0].1;
        assert_eq!(since, Some(cursor - ChronoDuration::seconds(30)));
        assert_eq!(h.store.get_cursor(&h.pr).await.unwrap(), Some(started));
    }

    #[tokio::test]
    async fn test_collects_all_kinds_and_filters() {
        let h = harness();
        let now = Utc::now();
        h.platform.set_details(
            &h.pr,
            pr_details("open", false, BRANCH, now - ChronoDuration::hours(1)),
        );
        h.platform
            .add_inline(&h.pr, inline_comment(1, "alice", "Rename", now));
        h.platform
            .add_inline(&h.pr, inline_comment(2, "codebot-007[bot]", "Done", now));
        h.platform
            .add_issue(&h.pr, issue_comment(3, "alice", "Why?", now));
        h.platform.add_issue(
            &h.pr,
            issue_comment(4, "alice", "ancient", now - ChronoDuration::days(3)),
        );
        h.platform
            .add_review(&h.pr, review(5, "bob", "COMMENTED", Some(""), now));
        h.platform
            .add_review(&h.pr, review(6, "bob", "APPROVED", None, now));

        let result = h.poller.poll_pr(task(), &h.pr, now).await.unwrap();
        assert!(matches!(result, PrPoll::Polled { enqueued: 3, .. }));
        assert_eq!(drain(&h.rx).await, vec![1, 3, 6]);
    }

    #[tokio::test]
    async fn test_repoll_does_not_enqueue_twice() {
        let h = harness();
        let now = Utc::now();
        h.platform.set_details(
            &h.pr,
            pr_details("open", false, BRANCH, now - ChronoDuration::hours(1)),
        );
        h.platform
            .add_inline(&h.pr, inline_comment(1, "alice", "Rename", now));
        h.store.put_task(&task()).await.unwrap();

        h.poller.poll_cycle().await;
        let second = h.poller.poll_cycle().await;

        assert_eq!(second.events_enqueued, 0);
        assert_eq!(drain(&h.rx).await, vec![1]);
    }

    #[tokio::test]
    async fn test_partial_failure_still_fetches_others_and_keeps_cursor() {
        let h = harness();
        let now = Utc::now();
        h.platform
            .set_details(&h.pr, pr_details("open", false, BRANCH, now));
        h.platform
            .add_inline(&h.pr, inline_comment(1, "alice", "Rename", now));
        h.platform
            .add_review(&h.pr, review(2, "bob", "CHANGES_REQUESTED", None, now));
        let cursor = now - ChronoDuration::minutes(5);
        h.store.advance_cursor(&h.pr, cursor).await.unwrap();
        h.platform.fail("list_issue_comments");

        let result = h.poller.poll_pr(task(), &h.pr, now).await.unwrap();

        match result {
            PrPoll::Polled {
                enqueued,
                outcome,
                cursor_advanced,
                ..
            } => {
                assert_eq!(enqueued, 2);
                assert_eq!(outcome, FetchOutcome { succeeded: 2, failed: 1 });
                assert!(!cursor_advanced);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.store.get_cursor(&h.pr).await.unwrap(), Some(cursor));
    }

    #[tokio::test]
    async fn test_partial_failure_on_first_contact_initializes_cursor() {
        let h = harness();
        let now = Utc::now();
        h.platform
            .set_details(&h.pr, pr_details("open", false, BRANCH, now));
        h.platform.fail("list_issue_comments");

        h.poller.poll_pr(task(), &h.pr, now).await.unwrap();
        assert_eq!(h.store.get_cursor(&h.pr).await.unwrap(), Some(now));
    }

    #[tokio::test]
    async fn test_unqueued_event_holds_cursor_back() {
        let Harness {
            store,
            platform,
            poller,
            rx,
            pr,
            _dir,
        } = harness();
        drop(rx);

        let now = Utc::now();
        let cursor = now - ChronoDuration::minutes(10);
        store.advance_cursor(&pr, cursor).await.unwrap();
        platform.set_details(&pr, pr_details("open", false, BRANCH, now));
        platform.add_inline(
            &pr,
            inline_comment(1, "alice", "Rename", now - ChronoDuration::minutes(5)),
        );

        let result = poller.poll_pr(task(), &pr, now).await.unwrap();

        assert_eq!(
            result,
            PrPoll::Polled {
                enqueued: 0,
                refused: 1,
                outcome: FetchOutcome {
                    succeeded: 3,
                    failed: 0
                },
                cursor_advanced: false,
            }
        );
        assert_eq!(store.get_cursor(&pr).await.unwrap(), Some(cursor));
        let key = codebot_core::DedupKey::new(
            pr.repo.clone(),
            codebot_core::EventKind::InlineComment,
            1,
        );
        assert!(!store.is_processed(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_unqueued_event_on_first_contact_leaves_cursor_unset() {
        let Harness {
            store,
            platform,
            poller,
            rx,
            pr,
            _dir,
        } = harness();
        drop(rx);

        let now = Utc::now();
        platform.set_details(
            &pr,
            pr_details("open", false, BRANCH, now - ChronoDuration::hours(1)),
        );
        platform.add_issue(&pr, issue_comment(3, "alice", "Why?", now));

        let result = poller.poll_pr(task(), &pr, now).await.unwrap();

        assert!(matches!(
            result,
            PrPoll::Polled {
                refused: 1,
                cursor_advanced: false,
                ..
            }
        ));
        assert_eq!(store.get_cursor(&pr).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_pr_is_reconciled_and_not_polled() {
        let h = harness();
        h.platform
            .set_details(&h.pr, pr_details("closed", true, BRANCH, Utc::now()));
        let task = task();
        h.store.put_task(&task).await.unwrap();

        let report = h.poller.poll_cycle().await;

        assert_eq!(report.prs_closed, 1);
        assert!(h.platform.since_seen.lock().unwrap().is_empty());
        let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_state_failure_isolated_per_pr() {
        let h = harness();
        h.platform.fail("get_pr_details");
        h.store.put_task(&task()).await.unwrap();

        let mut broken = task();
        broken.result = Some(TaskResult::new("not a url", BRANCH));
        h.store.put_task(&broken).await.unwrap();

        let report = h.poller.poll_cycle().await;
        assert_eq!(report.prs_failed, 1);
        assert_eq!(report.prs_polled, 0);
    }

    #[tokio::test]
    async fn test_prune_runs_each_cycle() {
        let h = harness();
        let key = codebot_core::DedupKey::new(
            codebot_core::RepoRef::new("acme", "widgets"),
            codebot_core::EventKind::IssueComment,
            1,
        );
        h.store
            .claim_event(&key, Utc::now() - ChronoDuration::days(30))
            .await
            .unwrap();

        h.poller.poll_cycle().await;
        assert!(!h.store.is_processed(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), h.poller.run(cancel))
            .await
            .unwrap();
    }
}

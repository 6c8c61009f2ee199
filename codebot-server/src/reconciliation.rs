//! Startup reconciliation for crash recovery.
//!
//! Runs once before the server accepts webhooks. Tasks a previous process
//! left `running` can never finish, so they are failed. Tasks that already
//! reached `completed` or `rejected` but still have a workspace on disk get
//! their cleanup retried.

use chrono::Utc;
use codebot_core::store::{EventStore, StoreError};
use codebot_core::TaskStatus;
use tracing::{info, warn};

use crate::lifecycle::LifecycleService;
use crate::workspace::WorkspaceResolver;

/// Upper bound on tasks examined per status.
const RECONCILE_LIMIT: usize = 10_000;

pub const INTERRUPTED_ERROR: &str = "interrupted by restart";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub interrupted: usize,
    pub cleanups_retried: usize,
}

pub async fn reconcile_on_startup(
    store: &dyn EventStore,
    lifecycle: &LifecycleService,
    workspaces: &WorkspaceResolver,
) -> Result<ReconcileReport, StoreError> {
    info!("Starting startup reconciliation...");
    let mut report = ReconcileReport::default();

    for mut task in store
        .list_tasks(Some(TaskStatus::Running), RECONCILE_LIMIT)
        .await?
    {
        if let Err(e) = task.fail(INTERRUPTED_ERROR, Utc::now()) {
            warn!("Cannot fail task {}: {}", task.id, e);
            continue;
        }
        store.put_task(&task).await?;
        warn!("Task {} was running at shutdown, marked failed", task.id);
        report.interrupted += 1;
    }

    for status in [TaskStatus::Completed, TaskStatus::Rejected] {
        for task in store.list_tasks(Some(status), RECONCILE_LIMIT).await? {
            let Some(branch) = task.branch_name() else {
                continue;
            };
            match workspaces.locate(branch, task.pr_id().as_ref()) {
                Ok(Some(_)) => {
                    lifecycle.cleanup(&task).await;
                    report.cleanups_retried += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Cannot search workspace of task {}: {}", task.id, e),
            }
        }
    }

    info!(
        "Reconciliation complete: {} interrupted, {} cleanups retried",
        report.interrupted, report.cleanups_retried
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGit;
    use codebot_core::store::InMemoryStore;
    use codebot_core::{Task, TaskResult};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reconcile_on_startup() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let workspaces = Arc::new(WorkspaceResolver::new(
            dir.path(),
            "u/codebot",
            Arc::new(FakeGit::new()),
        ));
        let lifecycle = LifecycleService::new(store.clone(), workspaces.clone());

        let mut running = Task::new("fix", "https://github.com/acme/widgets.git", Utc::now());
        running.start(Utc::now()).unwrap();
        store.put_task(&running).await.unwrap();

        let mut merged = Task::awaiting_review(
            "done",
            "https://github.com/acme/widgets.git",
            TaskResult::new(
                "https://github.com/acme/widgets/pull/7",
                "u/codebot/abc1234/done",
            ),
            Utc::now(),
        );
        merged.status = TaskStatus::Completed;
        store.put_task(&merged).await.unwrap();
        std::fs::create_dir(dir.path().join("task_abc1234")).unwrap();

        let pending = Task::new("later", "https://github.com/acme/widgets.git", Utc::now());
        store.put_task(&pending).await.unwrap();

        let report = reconcile_on_startup(store.as_ref(), &lifecycle, &workspaces)
            .await
            .unwrap();

        assert_eq!(
            report,
            ReconcileReport {
                interrupted: 1,
                cleanups_retried: 1
            }
        );
        let failed = store.get_task(&running.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some(INTERRUPTED_ERROR));
        assert!(!dir.path().join("task_abc1234").exists());
        assert_eq!(
            store.get_task(&pending.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }
}

//! Applies PR lifecycle observations to stored tasks.
//!
//! The webhook `pull_request` handler, the poller and startup
//! reconciliation all go through [`LifecycleService::apply`].

use std::sync::Arc;

use chrono::Utc;
use codebot_core::lifecycle::{transition, LifecycleEffect};
use codebot_core::store::{EventStore, StoreError};
use codebot_core::{ObservedPrState, Task};
use tracing::{info, warn};

use crate::workspace::WorkspaceResolver;

pub struct LifecycleService {
    store: Arc<dyn EventStore>,
    workspaces: Arc<WorkspaceResolver>,
}

impl LifecycleService {
    pub fn new(store: Arc<dyn EventStore>, workspaces: Arc<WorkspaceResolver>) -> Self {
        Self { store, workspaces }
    }

    /// Reconcile `task` with `observed` and return the task as stored.
    ///
    /// The status change is written before any cleanup runs. Cleanup
    /// failures are logged and never undo or fail the transition.
    pub async fn apply(&self, task: Task, observed: ObservedPrState) -> Result<Task, StoreError> {
        let before = task.status;
        let result = transition(task, observed, Utc::now());

        if result.changed {
            self.store.put_task(&result.task).await?;
            info!(
                "Task {} moved {} -> {} (PR {:?})",
                result.task.id, before, result.task.status, observed
            );
        }

        for effect in &result.effects {
            match effect {
                LifecycleEffect::DeleteWorkspace => self.cleanup(&result.task).await,
            }
        }

        Ok(result.task)
    }

    /// Best-effort workspace removal for a task.
    pub async fn cleanup(&self, task: &Task) {
        let Some(branch) = task.branch_name() else {
            return;
        };
        let pr = task.pr_id();
        match self.workspaces.delete_for_branch(branch, pr.as_ref()).await {
            Ok(true) => info!("Cleaned up workspace for task {}", task.id),
            Ok(false) => {}
            Err(e) => warn!("Workspace cleanup for task {} failed: {}", task.id, e),
        }
    }
}

//! Pure task/PR lifecycle transition.
//!
//! Both the webhook `pull_request` handler and the poller's per-cycle state
//! check funnel into [`transition`]. It has no side effects: the updated
//! task and the effects to run are returned as data.

use chrono::{DateTime, Utc};

use crate::model::ObservedPrState;
use crate::task::{Task, TaskStatus};

/// Side effects requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEffect {
    /// Remove the task's workspace. Best-effort; safe to repeat.
    DeleteWorkspace,
}

/// Result of a lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    pub task: Task,
    /// True when the task record differs from the input and must be written.
    pub changed: bool,
    pub effects: Vec<LifecycleEffect>,
}

impl TransitionResult {
    pub fn no_change(task: Task) -> Self {
        Self {
            task,
            changed: false,
            effects: vec![],
        }
    }
}

/// Reconcile a task with the observed state of its PR.
///
/// - open + completed/rejected: back to pending_review, `completed_at` cleared
/// - closed + merged: completed
/// - closed + not merged: rejected
///
/// Closed observations only apply to tasks that have a PR, and always ask
/// for workspace deletion so a failed cleanup is retried on the next pass.
/// Everything else is a no-op.
pub fn transition(task: Task, observed: ObservedPrState, now: DateTime<Utc>) -> TransitionResult {
    match observed {
        ObservedPrState::Open => match task.status {
            TaskStatus::Completed | TaskStatus::Rejected => {
                let mut task = task;
                task.status = TaskStatus::PendingReview;
                task.completed_at = None;
                TransitionResult {
                    task,
                    changed: true,
                    effects: vec![],
                }
            }
            _ => TransitionResult::no_change(task),
        },
        ObservedPrState::Closed { merged } => {
            if !task.status.has_pr() {
                return TransitionResult::no_change(task);
            }

            let target = if merged {
                TaskStatus::Completed
            } else {
                TaskStatus::Rejected
            };

            if task.status == target {
                return TransitionResult {
                    task,
                    changed: false,
                    effects: vec![LifecycleEffect::DeleteWorkspace],
                };
            }

            let mut task = task;
            task.status = target;
            task.completed_at = Some(now);
            TransitionResult {
                task,
                changed: true,
                effects: vec![LifecycleEffect::DeleteWorkspace],
            }
        }
    }
}

//! Persistence abstraction for processed-event keys, poll cursors and tasks.
//!
//! The [`EventStore`] trait is the only state shared between the webhook
//! handler, the poller and the workers. Every mutation is a single-row
//! upsert, so implementations need no cross-row transactions.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::{SqliteStore, DATABASE_FILE_NAME};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{DedupKey, PrId};
use crate::task::{Task, TaskStatus};

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("corrupt {what} in store")]
    Corruption { what: String },
}

impl StoreError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        StoreError::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        StoreError::Corruption { what: what.into() }
    }
}

/// Durable record of what has been seen, polled and submitted.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically mark `key` as processed.
    ///
    /// Returns `true` if this call recorded the key (the caller should
    /// enqueue the event) and `false` if it was already present.
    async fn claim_event(&self, key: &DedupKey, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Whether `key` has been marked processed.
    async fn is_processed(&self, key: &DedupKey) -> Result<bool, StoreError>;

    /// Forget a claimed key so a later observation can enqueue it again.
    async fn release_event(&self, key: &DedupKey) -> Result<(), StoreError>;

    /// Delete processed keys recorded before `cutoff`. Returns the number removed.
    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Last successful poll time for a PR.
    async fn get_cursor(&self, pr: &PrId) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Move the cursor to `to` if that is later than the stored value.
    /// Returns `true` when the cursor changed.
    async fn advance_cursor(&self, pr: &PrId, to: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Delete every cursor so all PRs are polled from scratch.
    async fn clear_cursors(&self) -> Result<usize, StoreError>;

    /// Insert or replace a task record.
    async fn put_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Tasks ordered by submission time, optionally filtered by status.
    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// Find the task whose branch embeds `workspace_id` as a path segment.
    async fn find_task_by_workspace_id(
        &self,
        workspace_id: &str,
    ) -> Result<Option<Task>, StoreError>;

    /// Find the task whose result carries exactly `pr_url`.
    async fn find_task_by_pr_url(&self, pr_url: &str) -> Result<Option<Task>, StoreError>;
}

/// True when `branch` contains `workspace_id` as a whole `/`-separated segment.
pub(crate) fn branch_has_segment(branch: &str, workspace_id: &str) -> bool {
    branch.split('/').any(|segment| segment == workspace_id)
}

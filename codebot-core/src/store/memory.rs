//! In-memory implementation of `EventStore`.
//!
//! All state is lost on restart. Used by tests and by deployments that do
//! not need durability.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{branch_has_segment, EventStore, StoreError};
use crate::model::{DedupKey, PrId};
use crate::task::{Task, TaskStatus};

#[derive(Default)]
pub struct InMemoryStore {
    processed: RwLock<HashMap<DedupKey, DateTime<Utc>>>,
    cursors: RwLock<HashMap<PrId, DateTime<Utc>>>,
    tasks: RwLock<HashMap<String, Task>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn claim_event(&self, key: &DedupKey, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut processed = self.processed.write().await;
        match processed.entry(key.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(now);
                Ok(true)
            }
        }
    }

    async fn is_processed(&self, key: &DedupKey) -> Result<bool, StoreError> {
        Ok(self.processed.read().await.contains_key(key))
    }

    async fn release_event(&self, key: &DedupKey) -> Result<(), StoreError> {
        self.processed.write().await.remove(key);
        Ok(())
    }

    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut processed = self.processed.write().await;
        let before = processed.len();
        processed.retain(|_, at| *at >= cutoff);
        Ok(before - processed.len())
    }

    async fn get_cursor(&self, pr: &PrId) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.cursors.read().await.get(pr).copied())
    }

    async fn advance_cursor(&self, pr: &PrId, to: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut cursors = self.cursors.write().await;
        match cursors.entry(pr.clone()) {
            Entry::Occupied(mut existing) => {
                if *existing.get() < to {
                    existing.insert(to);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(to);
                Ok(true)
            }
        }
    }

    async fn clear_cursors(&self) -> Result<usize, StoreError> {
        let mut cursors = self.cursors.write().await;
        let count = cursors.len();
        cursors.clear();
        Ok(count)
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        matching.truncate(limit);
        Ok(matching)
    }

    async fn find_task_by_workspace_id(
        &self,
        workspace_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .find(|t| {
                t.branch_name()
                    .is_some_and(|b| branch_has_segment(b, workspace_id))
            })
            .cloned())
    }

    async fn find_task_by_pr_url(&self, pr_url: &str) -> Result<Option<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .find(|t| t.pr_url() == Some(pr_url))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, RepoRef};
    use crate::task::TaskResult;
    use chrono::Duration;

    fn key(id: u64) -> DedupKey {
        DedupKey::new(RepoRef::new("acme", "widgets"), EventKind::InlineComment, id)
    }

    #[tokio::test]
    async fn test_claim_is_once_only() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        assert!(store.claim_event(&key(1), now).await.unwrap());
        assert!(!store.claim_event(&key(1), now).await.unwrap());
        assert!(store.is_processed(&key(1)).await.unwrap());

        store.release_event(&key(1)).await.unwrap();
        assert!(store.claim_event(&key(1), now).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_single_winner() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_event(&key(5), now).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_prune_removes_only_old_keys() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store
            .claim_event(&key(1), now - Duration::days(10))
            .await
            .unwrap();
        store.claim_event(&key(2), now).await.unwrap();

        let removed = store
            .prune_processed(now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!store.is_processed(&key(1)).await.unwrap());
        assert!(store.is_processed(&key(2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_cursor_is_forward_only() {
        let store = InMemoryStore::new();
        let pr = PrId::new("acme", "widgets", 42);
        let now = Utc::now();

        assert!(store.advance_cursor(&pr, now).await.unwrap());
        assert!(!store
            .advance_cursor(&pr, now - Duration::seconds(1))
            .await
            .unwrap());
        assert_eq!(store.get_cursor(&pr).await.unwrap(), Some(now));

        assert_eq!(store.clear_cursors().await.unwrap(), 1);
        assert_eq!(store.get_cursor(&pr).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_task_lookups() {
        let store = InMemoryStore::new();
        let task = Task::awaiting_review(
            "x",
            "https://github.com/acme/widgets.git",
            TaskResult::new(
                "https://github.com/acme/widgets/pull/42",
                "u/codebot/abc1234/x",
            ),
            Utc::now(),
        );
        store.put_task(&task).await.unwrap();

        let by_id = store.find_task_by_workspace_id("abc1234").await.unwrap();
        assert_eq!(by_id.map(|t| t.id), Some(task.id.clone()));
        assert!(store
            .find_task_by_workspace_id("abc123")
            .await
            .unwrap()
            .is_none());

        let by_url = store
            .find_task_by_pr_url("https://github.com/acme/widgets/pull/42")
            .await
            .unwrap();
        assert_eq!(by_url.map(|t| t.id), Some(task.id.clone()));

        let pending = store
            .list_tasks(Some(TaskStatus::PendingReview), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert!(store
            .list_tasks(Some(TaskStatus::Running), 10)
            .await
            .unwrap()
            .is_empty());
    }
}

//! Automation task records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::PrId;
use crate::naming::parse_pr_url;

/// Status of an automation task.
///
/// `Pending -> Running -> PendingReview` is driven by the job runner.
/// After that the PR lifecycle moves the task between `PendingReview`,
/// `Completed` and `Rejected`. `Failed` is reachable only before a PR exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    PendingReview,
    Completed,
    Rejected,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::PendingReview => "pending_review",
            TaskStatus::Completed => "completed",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Failed => "failed",
        }
    }

    /// Statuses that exist only once a PR has been opened.
    pub fn has_pr(&self) -> bool {
        matches!(
            self,
            TaskStatus::PendingReview | TaskStatus::Completed | TaskStatus::Rejected
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "pending_review" => Ok(TaskStatus::PendingReview),
            "completed" => Ok(TaskStatus::Completed),
            "rejected" => Ok(TaskStatus::Rejected),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Outcome of a task once its PR exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub pr_url: String,
    pub branch_name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskResult {
    pub fn new(pr_url: impl Into<String>, branch_name: impl Into<String>) -> Self {
        Self {
            pr_url: pr_url.into(),
            branch_name: branch_name.into(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("cannot {action} task {id}: status is {status}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        status: TaskStatus,
    },
}

/// One submitted automation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub description: String,
    pub repository_url: String,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<TaskResult>,
}

impl Task {
    /// Create a task in `Pending`.
    pub fn new(
        description: impl Into<String>,
        repository_url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            description: description.into(),
            repository_url: repository_url.into(),
            submitted_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        }
    }

    /// Create a record for a PR that already exists and awaits review.
    pub fn awaiting_review(
        description: impl Into<String>,
        repository_url: impl Into<String>,
        result: TaskResult,
        now: DateTime<Utc>,
    ) -> Self {
        let mut task = Self::new(description, repository_url, now);
        task.status = TaskStatus::PendingReview;
        task.started_at = Some(now);
        task.result = Some(result);
        task
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.require(TaskStatus::Pending == self.status, "start")?;
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn open_pr(&mut self, result: TaskResult) -> Result<(), TaskError> {
        self.require(TaskStatus::Running == self.status, "open a PR for")?;
        self.status = TaskStatus::PendingReview;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.require(
            matches!(self.status, TaskStatus::Pending | TaskStatus::Running),
            "fail",
        )?;
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn pr_url(&self) -> Option<&str> {
        self.result.as_ref().map(|r| r.pr_url.as_str())
    }

    pub fn branch_name(&self) -> Option<&str> {
        self.result.as_ref().map(|r| r.branch_name.as_str())
    }

    /// The PR this task opened, when its URL parses.
    pub fn pr_id(&self) -> Option<PrId> {
        self.pr_url().and_then(parse_pr_url)
    }

    fn require(&self, allowed: bool, action: &'static str) -> Result<(), TaskError> {
        if allowed {
            Ok(())
        } else {
            Err(TaskError::InvalidTransition {
                id: self.id.clone(),
                action,
                status: self.status,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_to_pending_review() {
        let now = Utc::now();
        let mut task = Task::new("add logging", "https://github.com/acme/widgets.git", now);
        assert_eq!(task.status, TaskStatus::Pending);

        task.start(now).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.started_at, Some(now));

        task.open_pr(TaskResult::new(
            "https://github.com/acme/widgets/pull/3",
            "u/codebot/abc1234/add-logging",
        ))
        .unwrap();
        assert_eq!(task.status, TaskStatus::PendingReview);
        assert_eq!(task.pr_url(), Some("https://github.com/acme/widgets/pull/3"));
        assert_eq!(task.pr_id(), Some(PrId::new("acme", "widgets", 3)));
    }

    #[test]
    fn test_failed_only_reachable_before_pr() {
        let now = Utc::now();
        let mut task = Task::awaiting_review(
            "x",
            "https://github.com/acme/widgets.git",
            TaskResult::new("https://github.com/acme/widgets/pull/3", "b"),
            now,
        );

        let err = task.fail("boom", now).unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition {
                status: TaskStatus::PendingReview,
                ..
            }
        ));

        let mut fresh = Task::new("y", "https://github.com/acme/widgets.git", now);
        fresh.fail("clone failed", now).unwrap();
        assert_eq!(fresh.status, TaskStatus::Failed);
        assert_eq!(fresh.error.as_deref(), Some("clone failed"));
        assert!(fresh.start(now).is_err());
    }

    #[test]
    fn test_result_extra_keys_survive_serde() {
        let json = serde_json::json!({
            "pr_url": "https://github.com/acme/widgets/pull/3",
            "branch_name": "u/codebot/abc1234/x",
            "commit": "deadbeef"
        });
        let result: TaskResult = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(result.extra.get("commit"), Some(&serde_json::json!("deadbeef")));
        assert_eq!(serde_json::to_value(&result).unwrap(), json);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(TaskStatus::PendingReview.to_string(), "pending_review");
        assert_eq!(
            "rejected".parse::<TaskStatus>().unwrap(),
            TaskStatus::Rejected
        );
        assert!("done".parse::<TaskStatus>().is_err());
    }
}

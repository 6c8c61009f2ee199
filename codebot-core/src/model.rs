//! Canonical shapes shared by the webhook and polling ingestion paths.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A repository identified by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// HTTPS clone URL on github.com.
    pub fn clone_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Unique identifier for a pull request across repositories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrId {
    pub repo: RepoRef,
    pub pr_number: u64,
}

impl PrId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, pr_number: u64) -> Self {
        Self {
            repo: RepoRef::new(owner, name),
            pr_number,
        }
    }

    /// Browser URL of the pull request, the form stored in task results.
    pub fn html_url(&self) -> String {
        format!(
            "https://github.com/{}/{}/pull/{}",
            self.repo.owner, self.repo.name, self.pr_number
        )
    }
}

impl fmt::Display for PrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.pr_number)
    }
}

/// The three collections a review event can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InlineComment,
    IssueComment,
    Review,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::InlineComment => "inline_comment",
            EventKind::IssueComment => "issue_comment",
            EventKind::Review => "review",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline_comment" => Ok(EventKind::InlineComment),
            "issue_comment" => Ok(EventKind::IssueComment),
            "review" => Ok(EventKind::Review),
            other => Err(format!("unknown event kind '{}'", other)),
        }
    }
}

/// Identity of an event for at-most-once processing.
///
/// Provider ids are only unique within one repository and one collection,
/// so all three parts are needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub repo: RepoRef,
    pub kind: EventKind,
    pub source_id: u64,
}

impl DedupKey {
    pub fn new(repo: RepoRef, kind: EventKind, source_id: u64) -> Self {
        Self {
            repo,
            kind,
            source_id,
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.repo, self.kind, self.source_id)
    }
}

/// Verdict attached to a submitted review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewVerdict {
    Commented,
    Approved,
    ChangesRequested,
    Dismissed,
    Pending,
}

impl ReviewVerdict {
    /// Parse a review state. The REST API reports `APPROVED` while webhooks
    /// send `approved`, so matching is case-insensitive.
    pub fn parse(state: &str) -> Option<Self> {
        match state.to_ascii_uppercase().as_str() {
            "COMMENTED" => Some(ReviewVerdict::Commented),
            "APPROVED" => Some(ReviewVerdict::Approved),
            "CHANGES_REQUESTED" => Some(ReviewVerdict::ChangesRequested),
            "DISMISSED" => Some(ReviewVerdict::Dismissed),
            "PENDING" => Some(ReviewVerdict::Pending),
            _ => None,
        }
    }
}

/// Decide the body a review is enqueued with, or `None` to drop it.
///
/// Only commented, approved and changes-requested reviews are actionable.
/// An empty body is kept only when the verdict itself carries meaning.
pub fn review_body(verdict: ReviewVerdict, body: Option<&str>) -> Option<String> {
    let body = body.map(str::trim).unwrap_or_default();
    match verdict {
        ReviewVerdict::Commented | ReviewVerdict::Approved | ReviewVerdict::ChangesRequested
            if !body.is_empty() =>
        {
            Some(body.to_string())
        }
        ReviewVerdict::Approved => Some("PR approved".to_string()),
        ReviewVerdict::ChangesRequested => Some("Changes requested".to_string()),
        _ => None,
    }
}

/// Per-kind fields of a review event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetail {
    InlineComment {
        comment_id: u64,
        path: Option<String>,
        line: Option<u64>,
        diff_hunk: Option<String>,
        in_reply_to: Option<u64>,
    },
    IssueComment {
        comment_id: u64,
    },
    Review {
        review_id: u64,
        verdict: ReviewVerdict,
    },
}

/// A single unit of reviewer feedback, normalized from either ingestion path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewEvent {
    pub repo: RepoRef,
    pub pr_number: u64,
    /// Head branch of the PR. Issue comments do not carry it, so it may be
    /// resolved later by the worker.
    pub branch_name: Option<String>,
    pub author: String,
    pub body: String,
    pub created_at: Option<DateTime<Utc>>,
    pub detail: EventDetail,
}

impl ReviewEvent {
    pub fn kind(&self) -> EventKind {
        match self.detail {
            EventDetail::InlineComment { .. } => EventKind::InlineComment,
            EventDetail::IssueComment { .. } => EventKind::IssueComment,
            EventDetail::Review { .. } => EventKind::Review,
        }
    }

    /// Provider-assigned comment or review id.
    pub fn source_id(&self) -> u64 {
        match self.detail {
            EventDetail::InlineComment { comment_id, .. } => comment_id,
            EventDetail::IssueComment { comment_id } => comment_id,
            EventDetail::Review { review_id, .. } => review_id,
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.repo.clone(), self.kind(), self.source_id())
    }

    pub fn pr_id(&self) -> PrId {
        PrId {
            repo: self.repo.clone(),
            pr_number: self.pr_number,
        }
    }

    /// True when the event was written by the given login (compared
    /// case-insensitively, as GitHub logins are).
    pub fn is_authored_by(&self, login: &str) -> bool {
        self.author.eq_ignore_ascii_case(login)
    }
}

/// Pull request lifecycle as observed from GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedPrState {
    Open,
    Closed { merged: bool },
}

impl ObservedPrState {
    /// Build from the REST `state` string and `merged` flag.
    pub fn from_api(state: &str, merged: bool) -> Self {
        if state.eq_ignore_ascii_case("closed") {
            ObservedPrState::Closed { merged }
        } else {
            ObservedPrState::Open
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ObservedPrState::Closed { .. })
    }
}

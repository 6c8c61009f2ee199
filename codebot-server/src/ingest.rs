//! Normalization of GitHub payloads into [`ReviewEvent`]s.
//!
//! Webhook payloads and REST listings share the comment and review shapes,
//! so both ingestion paths convert through these functions.

use codebot_core::{review_body, EventDetail, RepoRef, ReviewEvent, ReviewVerdict};
use tracing::debug;

use crate::github::{InlineComment, IssueComment, Review};

pub fn inline_event(
    repo: &RepoRef,
    pr_number: u64,
    branch: Option<&str>,
    comment: &InlineComment,
) -> ReviewEvent {
    ReviewEvent {
        repo: repo.clone(),
        pr_number,
        branch_name: branch.map(str::to_string),
        author: comment.user.login.clone(),
        body: comment.body.clone(),
        created_at: Some(comment.created_at),
        detail: EventDetail::InlineComment {
            comment_id: comment.id,
            path: comment.path.clone(),
            line: comment.line,
            diff_hunk: comment.diff_hunk.clone(),
            in_reply_to: comment.in_reply_to_id,
        },
    }
}

pub fn issue_event(
    repo: &RepoRef,
    pr_number: u64,
    branch: Option<&str>,
    comment: &IssueComment,
) -> ReviewEvent {
    ReviewEvent {
        repo: repo.clone(),
        pr_number,
        branch_name: branch.map(str::to_string),
        author: comment.user.login.clone(),
        body: comment.body.clone(),
        created_at: Some(comment.created_at),
        detail: EventDetail::IssueComment {
            comment_id: comment.id,
        },
    }
}

/// `None` for reviews that carry nothing to act on.
pub fn review_event(
    repo: &RepoRef,
    pr_number: u64,
    branch: Option<&str>,
    review: &Review,
) -> Option<ReviewEvent> {
    let Some(verdict) = ReviewVerdict::parse(&review.state) else {
        debug!("Dropping review {}: unknown state {}", review.id, review.state);
        return None;
    };
    let Some(body) = review_body(verdict, review.body.as_deref()) else {
        debug!("Dropping review {}: empty {:?} review", review.id, verdict);
        return None;
    };

    Some(ReviewEvent {
        repo: repo.clone(),
        pr_number,
        branch_name: branch.map(str::to_string),
        author: review.user.login.clone(),
        body,
        created_at: review.submitted_at,
        detail: EventDetail::Review {
            review_id: review.id,
            verdict,
        },
    })
}

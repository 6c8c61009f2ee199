//! Review comment thread reconstruction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The parts of an inline review comment needed to rebuild its thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadComment {
    pub id: u64,
    pub in_reply_to: Option<u64>,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Rebuild the thread containing `comment_id`.
///
/// Walks `in_reply_to` links up to the root, then collects the root and
/// every comment whose reply chain reaches it, ordered by creation time.
/// Returns an empty list when `comment_id` is not among `comments`.
pub fn reconstruct_thread(comments: &[ThreadComment], comment_id: u64) -> Vec<ThreadComment> {
    let by_id: HashMap<u64, &ThreadComment> = comments.iter().map(|c| (c.id, c)).collect();

    let Some(start) = by_id.get(&comment_id) else {
        return Vec::new();
    };

    let root_id = root_of(&by_id, start.id);

    let mut thread: Vec<ThreadComment> = comments
        .iter()
        .filter(|c| root_of(&by_id, c.id) == root_id)
        .cloned()
        .collect();
    thread.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    thread
}

/// Follow reply links as far as they resolve.
///
/// A reply cycle has no root, so every comment leading into it resolves to
/// the cycle's smallest id.
fn root_of(by_id: &HashMap<u64, &ThreadComment>, id: u64) -> u64 {
    let mut path = vec![id];
    let mut current = id;

    while let Some(parent) = by_id.get(&current).and_then(|c| c.in_reply_to) {
        if !by_id.contains_key(&parent) {
            break;
        }
        if let Some(pos) = path.iter().position(|&seen| seen == parent) {
            return path[pos..].iter().copied().min().unwrap_or(parent);
        }
        path.push(parent);
        current = parent;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn comment(id: u64, in_reply_to: Option<u64>, secs: i64) -> ThreadComment {
        ThreadComment {
            id,
            in_reply_to,
            author: format!("user{}", id),
            body: format!("comment {}", id),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_collects_root_and_descendants_in_order() {
        let comments = vec![
            comment(3, Some(1), 30),
            comment(1, None, 10),
            comment(2, Some(1), 20),
            comment(4, Some(3), 40),
            comment(9, None, 5),
            comment(10, Some(9), 50),
        ];

        let ids: Vec<u64> = reconstruct_thread(&comments, 4)
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_from_root_includes_replies() {
        let comments = vec![comment(1, None, 0), comment(2, Some(1), 1)];
        assert_eq!(reconstruct_thread(&comments, 1).len(), 2);
    }

    #[test]
    fn test_unknown_comment_yields_empty_thread() {
        let comments = vec![comment(1, None, 0)];
        assert!(reconstruct_thread(&comments, 99).is_empty());
    }

    #[test]
    fn test_dangling_parent_becomes_root() {
        // Parent 5 was deleted; 6 and 7 still form a thread.
        let comments = vec![comment(6, Some(5), 0), comment(7, Some(6), 1)];
        let ids: Vec<u64> = reconstruct_thread(&comments, 7)
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![6, 7]);
    }

    #[test]
    fn test_cycle_forms_one_thread() {
        // 1 and 2 reply to each other; 3 hangs off the cycle, 0 off 3.
        let comments = vec![
            comment(1, Some(2), 0),
            comment(2, Some(1), 1),
            comment(3, Some(2), 2),
            comment(0, Some(3), 3),
            comment(8, None, 4),
        ];

        for start in [0, 1, 2, 3] {
            let ids: Vec<u64> = reconstruct_thread(&comments, start)
                .iter()
                .map(|c| c.id)
                .collect();
            assert_eq!(ids, vec![1, 2, 3, 0], "thread of {}", start);
        }
    }
}

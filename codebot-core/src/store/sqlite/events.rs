//! Processed-event keys and poll cursors.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::u64_to_i64;
use crate::model::{DedupKey, PrId};

pub(super) fn claim_sync(
    conn: &Connection,
    key: &DedupKey,
    now: DateTime<Utc>,
) -> Result<bool, String> {
    let source_id = u64_to_i64(key.source_id, "source id")?;
    conn.execute(
        "INSERT OR IGNORE INTO processed_events
             (repo_owner, repo_name, kind, source_id, processed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            key.repo.owner,
            key.repo.name,
            key.kind.as_str(),
            source_id,
            now.timestamp()
        ],
    )
    .map_err(|e| e.to_string())?;
    Ok(conn.changes() > 0)
}

pub(super) fn is_processed_sync(conn: &Connection, key: &DedupKey) -> Result<bool, String> {
    let source_id = u64_to_i64(key.source_id, "source id")?;
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM processed_events
             WHERE repo_owner = ?1 AND repo_name = ?2 AND kind = ?3 AND source_id = ?4)",
        params![key.repo.owner, key.repo.name, key.kind.as_str(), source_id],
        |row| row.get(0),
    )
    .map_err(|e| e.to_string())
}

pub(super) fn release_sync(conn: &Connection, key: &DedupKey) -> Result<(), String> {
    let source_id = u64_to_i64(key.source_id, "source id")?;
    conn.execute(
        "DELETE FROM processed_events
         WHERE repo_owner = ?1 AND repo_name = ?2 AND kind = ?3 AND source_id = ?4",
        params![key.repo.owner, key.repo.name, key.kind.as_str(), source_id],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

pub(super) fn prune_sync(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize, String> {
    conn.execute(
        "DELETE FROM processed_events WHERE processed_at < ?1",
        params![cutoff.timestamp()],
    )
    .map_err(|e| e.to_string())
}

pub(super) fn get_cursor_sync(
    conn: &Connection,
    pr: &PrId,
) -> Result<Option<DateTime<Utc>>, String> {
    let pr_number = u64_to_i64(pr.pr_number, "PR number")?;
    let micros: Option<i64> = conn
        .query_row(
            "SELECT last_polled_at FROM poll_cursors
             WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3",
            params![pr.repo.owner, pr.repo.name, pr_number],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| e.to_string())?;

    match micros {
        Some(micros) => DateTime::from_timestamp_micros(micros)
            .map(Some)
            .ok_or_else(|| format!("cursor for {} is out of range: {}", pr, micros)),
        None => Ok(None),
    }
}

/// The conditional upsert leaves the row untouched when `to` is not later
/// than the stored value, so `changes()` reports whether it moved.
pub(super) fn advance_cursor_sync(
    conn: &Connection,
    pr: &PrId,
    to: DateTime<Utc>,
) -> Result<bool, String> {
    let pr_number = u64_to_i64(pr.pr_number, "PR number")?;
    conn.execute(
        "INSERT INTO poll_cursors (repo_owner, repo_name, pr_number, last_polled_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(repo_owner, repo_name, pr_number) DO UPDATE SET
             last_polled_at = excluded.last_polled_at
         WHERE excluded.last_polled_at > poll_cursors.last_polled_at",
        params![pr.repo.owner, pr.repo.name, pr_number, to.timestamp_micros()],
    )
    .map_err(|e| e.to_string())?;
    Ok(conn.changes() > 0)
}

pub(super) fn clear_cursors_sync(conn: &Connection) -> Result<usize, String> {
    conn.execute("DELETE FROM poll_cursors", [])
        .map_err(|e| e.to_string())
}

//! Task records.
//!
//! `pr_url` and `branch_name` are denormalised out of `result_json` so the
//! webhook lookups can use indexed queries.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

use crate::task::{Task, TaskResult, TaskStatus};

const TASK_COLUMNS: &str = "id, status, description, repository_url, submitted_at, \
                            started_at, completed_at, error, result_json";

/// Raw column values as read from SQLite, before validation.
struct TaskRow {
    id: String,
    status: String,
    description: String,
    repository_url: String,
    submitted_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    result_json: Option<String>,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            description: row.get(2)?,
            repository_url: row.get(3)?,
            submitted_at: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
            error: row.get(7)?,
            result_json: row.get(8)?,
        })
    }

    fn into_task(self) -> Result<Task, String> {
        let status: TaskStatus = self.status.parse()?;
        let result = match self.result_json {
            Some(json) => Some(
                serde_json::from_str::<TaskResult>(&json)
                    .map_err(|e| format!("result JSON: {}", e))?,
            ),
            None => None,
        };
        Ok(Task {
            id: self.id,
            status,
            description: self.description,
            repository_url: self.repository_url,
            submitted_at: parse_timestamp(&self.submitted_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
            error: self.error,
            result,
        })
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| format!("timestamp '{}': {}", raw, e))
}

pub(super) fn put_sync(conn: &Connection, task: &Task) -> Result<(), String> {
    let result_json = task
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| format!("serialize result: {}", e))?;

    conn.execute(
        "INSERT INTO tasks (id, status, description, repository_url, submitted_at,
                            started_at, completed_at, error, result_json, pr_url, branch_name)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             description = excluded.description,
             repository_url = excluded.repository_url,
             submitted_at = excluded.submitted_at,
             started_at = excluded.started_at,
             completed_at = excluded.completed_at,
             error = excluded.error,
             result_json = excluded.result_json,
             pr_url = excluded.pr_url,
             branch_name = excluded.branch_name",
        params![
            task.id,
            task.status.as_str(),
            task.description,
            task.repository_url,
            format_timestamp(task.submitted_at),
            task.started_at.map(format_timestamp),
            task.completed_at.map(format_timestamp),
            task.error,
            result_json,
            task.pr_url(),
            task.branch_name(),
        ],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

pub(super) fn get_sync(conn: &Connection, id: &str) -> Result<Option<Task>, String> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            TaskRow::read,
        )
        .optional()
        .map_err(|e| e.to_string())?;
    row.map(TaskRow::into_task).transpose()
}

pub(super) fn list_sync(
    conn: &Connection,
    status: Option<TaskStatus>,
    limit: i64,
) -> Result<Vec<Task>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM tasks
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY submitted_at, id
             LIMIT ?2",
            TASK_COLUMNS
        ))
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map(params![status.map(|s| s.as_str()), limit], TaskRow::read)
        .map_err(|e| e.to_string())?;

    let mut tasks = Vec::new();
    for row in rows {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                warn!("Failed to read task row from SQLite: {}", e);
                continue;
            }
        };
        let id = row.id.clone();
        match row.into_task() {
            Ok(task) => tasks.push(task),
            Err(e) => warn!("Skipping corrupt task {}: {}", id, e),
        }
    }
    Ok(tasks)
}

/// The workspace id must appear as a whole path segment of the branch, either
/// in the middle or at the end.
pub(super) fn find_by_workspace_id_sync(
    conn: &Connection,
    workspace_id: &str,
) -> Result<Option<Task>, String> {
    if workspace_id.is_empty() || workspace_id.contains(&['%', '_', '/'][..]) {
        return Ok(None);
    }
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM tasks
                 WHERE branch_name LIKE '%/' || ?1 || '/%'
                    OR branch_name LIKE '%/' || ?1
                    OR branch_name = ?1
                 ORDER BY submitted_at DESC
                 LIMIT 1",
                TASK_COLUMNS
            ),
            params![workspace_id],
            TaskRow::read,
        )
        .optional()
        .map_err(|e| e.to_string())?;
    row.map(TaskRow::into_task).transpose()
}

pub(super) fn find_by_pr_url_sync(conn: &Connection, pr_url: &str) -> Result<Option<Task>, String> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM tasks WHERE pr_url = ?1 ORDER BY submitted_at DESC LIMIT 1",
                TASK_COLUMNS
            ),
            params![pr_url],
            TaskRow::read,
        )
        .optional()
        .map_err(|e| e.to_string())?;
    row.map(TaskRow::into_task).transpose()
}

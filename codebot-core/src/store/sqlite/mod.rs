//! SQLite implementation of `EventStore`.
//!
//! This provides persistent storage that survives service restarts.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.

mod events;
mod tasks;


use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::{EventStore, StoreError};
use crate::model::{DedupKey, PrId};
use crate::task::{Task, TaskStatus};

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// File name of the state database inside the state directory.
pub const DATABASE_FILE_NAME: &str = "codebot-state.db";

/// SQLite-backed event store.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// # Durability
    ///
    /// - `journal_mode = WAL`
    /// - `synchronous = FULL`
    /// - `busy_timeout = 5000ms`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;

        // Task descriptions may carry private repository details.
        #[cfg(unix)]
        if !is_in_memory && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite can silently keep DELETE mode on filesystems without shared
        // memory support. In-memory databases report "memory".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the database file inside `state_dir`.
    pub fn open_in_dir<P: AsRef<Path>>(state_dir: P) -> Result<Self, StoreError> {
        Self::new(state_dir.as_ref().join(DATABASE_FILE_NAME))
    }

    /// Create a new in-memory SQLite store.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS processed_events (
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    source_id INTEGER NOT NULL,
                    processed_at INTEGER NOT NULL,
                    PRIMARY KEY (repo_owner, repo_name, kind, source_id)
                );
                CREATE INDEX IF NOT EXISTS idx_processed_at
                    ON processed_events(processed_at);

                CREATE TABLE IF NOT EXISTS poll_cursors (
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    last_polled_at INTEGER NOT NULL,
                    PRIMARY KEY (repo_owner, repo_name, pr_number)
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    description TEXT NOT NULL,
                    repository_url TEXT NOT NULL,
                    submitted_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    error TEXT,
                    result_json TEXT,
                    pr_url TEXT,
                    branch_name TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_pr_url
                    ON tasks(pr_url) WHERE pr_url IS NOT NULL;
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, String> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::storage(operation, "connection mutex poisoned"))?;
            f(&conn).map_err(|message| StoreError::storage(operation, message))
        })
        .await
        .map_err(|e| StoreError::storage(operation, e.to_string()))?
    }
}

fn u64_to_i64(value: u64, what: &str) -> Result<i64, String> {
    i64::try_from(value).map_err(|_| format!("{} {} exceeds i64::MAX", what, value))
}

fn usize_to_i64_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn claim_event(&self, key: &DedupKey, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let key = key.clone();
        self.with_conn("claim_event", move |conn| {
            events::claim_sync(conn, &key, now)
        })
        .await
    }

    async fn is_processed(&self, key: &DedupKey) -> Result<bool, StoreError> {
        let key = key.clone();
        self.with_conn("is_processed", move |conn| {
            events::is_processed_sync(conn, &key)
        })
        .await
    }

    async fn release_event(&self, key: &DedupKey) -> Result<(), StoreError> {
        let key = key.clone();
        self.with_conn("release_event", move |conn| {
            events::release_sync(conn, &key)
        })
        .await
    }

    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.with_conn("prune_processed", move |conn| {
            events::prune_sync(conn, cutoff)
        })
        .await
    }

    async fn get_cursor(&self, pr: &PrId) -> Result<Option<DateTime<Utc>>, StoreError> {
        let pr = pr.clone();
        self.with_conn("get_cursor", move |conn| events::get_cursor_sync(conn, &pr))
            .await
    }

    async fn advance_cursor(&self, pr: &PrId, to: DateTime<Utc>) -> Result<bool, StoreError> {
        let pr = pr.clone();
        self.with_conn("advance_cursor", move |conn| {
            events::advance_cursor_sync(conn, &pr, to)
        })
        .await
    }

    async fn clear_cursors(&self) -> Result<usize, StoreError> {
        self.with_conn("clear_cursors", events::clear_cursors_sync)
            .await
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        let task = task.clone();
        self.with_conn("put_task", move |conn| tasks::put_sync(conn, &task))
            .await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let id = id.to_string();
        self.with_conn("get_task", move |conn| tasks::get_sync(conn, &id))
            .await
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        self.with_conn("list_tasks", move |conn| {
            tasks::list_sync(conn, status, usize_to_i64_limit(limit))
        })
        .await
    }

    async fn find_task_by_workspace_id(
        &self,
        workspace_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        let workspace_id = workspace_id.to_string();
        self.with_conn("find_task_by_workspace_id", move |conn| {
            tasks::find_by_workspace_id_sync(conn, &workspace_id)
        })
        .await
    }

    async fn find_task_by_pr_url(&self, pr_url: &str) -> Result<Option<Task>, StoreError> {
        let pr_url = pr_url.to_string();
        self.with_conn("find_task_by_pr_url", move |conn| {
            tasks::find_by_pr_url_sync(conn, &pr_url)
        })
        .await
    }
}

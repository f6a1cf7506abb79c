//! Queue storage repositories.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::model::{Action, ActionId, ActionKind, ActionTarget, FailedAction, UnreadableAction};
use crate::Result;

async fn connect(database_path: &str) -> Result<SqlitePool> {
    let url = format!("sqlite:{database_path}?mode=rwc");
    Ok(SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?)
}

async fn connect_in_memory() -> Result<SqlitePool> {
    Ok(SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn action_from_row(row: &SqliteRow, id_column: &str) -> Option<Action> {
    let id: String = row.get(id_column);
    let kind: String = row.get("kind");
    let target_kind: String = row.get("target_kind");
    let enqueued_at: String = row.get("enqueued_at");

    let action = Action {
        id: ActionId::parse(&id)?,
        target: ActionTarget::from_parts(&target_kind, row.get("target"))?,
        kind: ActionKind::parse(&kind)?,
        param1: row.get("param1"),
        param2: row.get("param2"),
        enqueued_at: parse_timestamp(&enqueued_at)?,
    };
    Some(action)
}

fn collect_actions(rows: &[SqliteRow], id_column: &str) -> Vec<Action> {
    rows.iter()
        .filter_map(|row| {
            let action = action_from_row(row, id_column);
            if action.is_none() {
                let id: String = row.get(id_column);
                warn!(action_id = %id, "Skipping unreadable queued action");
            }
            action
        })
        .collect()
}

/// Durable FIFO queue of pending actions (the outbox).
///
/// Every enqueue wakes whoever waits on [`MutationQueue::waker`].
pub struct MutationQueue {
    pool: SqlitePool,
    wake: Arc<Notify>,
}

impl MutationQueue {
    /// Create a new queue backed by the given database path.
    ///
    /// Creates the database and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let queue = Self {
            pool: connect(database_path).await?,
            wake: Arc::new(Notify::new()),
        };
        queue.initialize().await?;
        Ok(queue)
    }

    /// Create an in-memory queue for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let queue = Self {
            pool: connect_in_memory().await?,
            wake: Arc::new(Notify::new()),
        };
        queue.initialize().await?;
        Ok(queue)
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS queued_actions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                target_kind TEXT NOT NULL,
                target TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL,
                param1 TEXT,
                param2 TEXT,
                enqueued_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_queued_actions_target ON queued_actions(target)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Handle that is notified on every enqueue.
    #[must_use]
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Append an action and wake the drain loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn enqueue(&self, action: &Action) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO queued_actions (id, target_kind, target, kind, param1, param2, enqueued_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(action.id.to_string())
        .bind(action.target.kind_str())
        .bind(action.target.id())
        .bind(action.kind.as_str())
        .bind(&action.param1)
        .bind(&action.param2)
        .bind(action.enqueued_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(action_id = %action.id, kind = %action.kind, target = action.target.id(), "Enqueued action");
        self.wake.notify_one();
        Ok(())
    }

    /// Oldest action, without removing it.
    ///
    /// Rows ahead of it that no longer decode are deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn peek_next(&self) -> Result<Option<Action>> {
        Ok(self.next_readable().await?.0)
    }

    /// Oldest decodable action, plus every unreadable row deleted on the way
    /// to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn next_readable(&self) -> Result<(Option<Action>, Vec<UnreadableAction>)> {
        let mut discarded = Vec::new();
        loop {
            let row = sqlx::query(
                r"
                SELECT seq, id, target_kind, target, kind, param1, param2, enqueued_at
                FROM queued_actions
                ORDER BY seq ASC
                LIMIT 1
                ",
            )
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok((None, discarded));
            };
            if let Some(action) = action_from_row(&row, "id") {
                return Ok((Some(action), discarded));
            }

            let seq: i64 = row.get("seq");
            sqlx::query("DELETE FROM queued_actions WHERE seq = ?")
                .bind(seq)
                .execute(&self.pool)
                .await?;
            let unreadable = UnreadableAction {
                id: row.get("id"),
                kind: row.get("kind"),
            };
            warn!(action_id = %unreadable.id, kind = %unreadable.kind, "Removed unreadable queued action");
            discarded.push(unreadable);
        }
    }

    /// Remove an action by id. Returns true if it was queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn remove(&self, id: ActionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queued_actions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove every queued action of one of `kinds` aimed at `target`.
    ///
    /// Returns the number of actions removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn remove_matching(&self, target: &ActionTarget, kinds: &[ActionKind]) -> Result<u64> {
        let mut removed = 0;
        for kind in kinds {
            let result = sqlx::query(
                r"
                DELETE FROM queued_actions
                WHERE target_kind = ? AND target = ? AND kind = ?
                ",
            )
            .bind(target.kind_str())
            .bind(target.id())
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;
            removed += result.rows_affected();
        }

        if removed > 0 {
            debug!(target = target.id(), removed, "Removed superseded actions");
        }
        Ok(removed)
    }

    /// All queued actions in execution order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self) -> Result<Vec<Action>> {
        let rows = sqlx::query(
            r"
            SELECT id, target_kind, target, kind, param1, param2, enqueued_at
            FROM queued_actions
            ORDER BY seq ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(collect_actions(&rows, "id"))
    }

    /// Number of queued actions.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn len(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM queued_actions")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Returns true if nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop every queued action.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM queued_actions")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Durable holding area for actions that failed with a retryable server error.
pub struct FailedQueue {
    pool: SqlitePool,
}

impl FailedQueue {
    /// Create a new failed queue backed by the given database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let queue = Self {
            pool: connect(database_path).await?,
        };
        queue.initialize().await?;
        Ok(queue)
    }

    /// Create an in-memory failed queue for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let queue = Self {
            pool: connect_in_memory().await?,
        };
        queue.initialize().await?;
        Ok(queue)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS failed_actions (
                action_id TEXT PRIMARY KEY,
                target_kind TEXT NOT NULL,
                target TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL,
                param1 TEXT,
                param2 TEXT,
                enqueued_at TEXT NOT NULL,
                error TEXT NOT NULL DEFAULT '',
                status INTEGER,
                code INTEGER,
                failed_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Park an action, replacing any earlier capture for the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn park(&self, failed: &FailedAction) -> Result<()> {
        let action = &failed.action;
        sqlx::query(
            r"
            INSERT INTO failed_actions
                (action_id, target_kind, target, kind, param1, param2, enqueued_at, error, status, code, failed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(action_id) DO UPDATE SET
                error = excluded.error,
                status = excluded.status,
                code = excluded.code,
                failed_at = excluded.failed_at
            ",
        )
        .bind(action.id.to_string())
        .bind(action.target.kind_str())
        .bind(action.target.id())
        .bind(action.kind.as_str())
        .bind(&action.param1)
        .bind(&action.param2)
        .bind(action.enqueued_at.to_rfc3339())
        .bind(&failed.error)
        .bind(failed.status.map(i64::from))
        .bind(failed.code)
        .bind(failed.failed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All parked actions, oldest failure first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self) -> Result<Vec<FailedAction>> {
        let rows = sqlx::query(
            r"
            SELECT action_id, target_kind, target, kind, param1, param2, enqueued_at,
                   error, status, code, failed_at
            FROM failed_actions
            ORDER BY failed_at ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        let failed = rows
            .iter()
            .filter_map(|row| {
                let action = action_from_row(row, "action_id")?;
                let failed_at: String = row.get("failed_at");
                let status: Option<i64> = row.get("status");
                Some(FailedAction {
                    action,
                    error: row.get("error"),
                    status: status.and_then(|s| u16::try_from(s).ok()),
                    code: row.get("code"),
                    failed_at: parse_timestamp(&failed_at)?,
                })
            })
            .collect();

        Ok(failed)
    }

    /// Remove a parked action by its original id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn remove(&self, id: ActionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM failed_actions WHERE action_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Number of parked actions.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn len(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM failed_actions")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Returns true if nothing is parked.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop every parked action.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM failed_actions")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

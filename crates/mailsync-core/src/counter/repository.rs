//! Counter storage repository.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::debug;

use super::model::{LabelCounter, SyncWindow, clamp_unread};
use crate::Result;

const EVENT_CURSOR_KEY: &str = "last_event_id";

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value?)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn counter_from_row(row: &SqliteRow) -> LabelCounter {
    LabelCounter {
        label_id: row.get("label_id"),
        unread: clamp_unread(row.get("unread")),
        window: SyncWindow {
            start: parse_timestamp(row.get("window_start")),
            end: parse_timestamp(row.get("window_end")),
            total: row.get("total"),
            updated_at: parse_timestamp(row.get("updated_at")),
        },
    }
}

/// Durable per-label counters plus the event cursor.
///
/// Unread counts are clamped at zero inside the same statement that changes
/// them, so concurrent increments and decrements can never drive a count
/// negative.
pub struct CounterStore {
    pool: SqlitePool,
}

impl CounterStore {
    /// Create a new store with the given database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS label_counters (
                label_id TEXT PRIMARY KEY,
                unread INTEGER NOT NULL DEFAULT 0 CHECK (unread >= 0),
                window_start TEXT,
                window_end TEXT,
                total INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Unread count of a label (zero if unknown).
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn unread(&self, label_id: &str) -> Result<u32> {
        let row = sqlx::query("SELECT unread FROM label_counters WHERE label_id = ?")
            .bind(label_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map_or(0, |row| clamp_unread(row.get("unread"))))
    }

    /// Set the unread count of a label, clamping negative values to zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_unread(&self, label_id: &str, count: i64) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO label_counters (label_id, unread) VALUES (?, MAX(?, 0))
            ON CONFLICT(label_id) DO UPDATE SET unread = excluded.unread
            ",
        )
        .bind(label_id)
        .bind(count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Add `delta` to the unread count of a label, clamping at zero.
    ///
    /// Returns the new count.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn adjust_unread(&self, label_id: &str, delta: i64) -> Result<u32> {
        let row = sqlx::query(
            r"
            INSERT INTO label_counters (label_id, unread) VALUES (?, MAX(?, 0))
            ON CONFLICT(label_id) DO UPDATE SET unread = MAX(unread + ?, 0)
            RETURNING unread
            ",
        )
        .bind(label_id)
        .bind(delta)
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;

        Ok(clamp_unread(row.get("unread")))
    }

    /// Reset every known unread count to zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn reset_unread(&self) -> Result<()> {
        sqlx::query("UPDATE label_counters SET unread = 0")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace all unread counts with a server snapshot.
    ///
    /// Every known counter is zeroed first, then each `(label, unread)` pair is
    /// written, all in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the database transaction fails.
    pub async fn replace_unread(&self, snapshot: &[(String, i64)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE label_counters SET unread = 0")
            .execute(&mut *tx)
            .await?;

        for (label_id, unread) in snapshot {
            sqlx::query(
                r"
                INSERT INTO label_counters (label_id, unread) VALUES (?, MAX(?, 0))
                ON CONFLICT(label_id) DO UPDATE SET unread = excluded.unread
                ",
            )
            .bind(label_id)
            .bind(unread)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(labels = snapshot.len(), "Replaced unread counters");
        Ok(())
    }

    /// All known counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn all(&self) -> Result<Vec<LabelCounter>> {
        let rows = sqlx::query(
            r"
            SELECT label_id, unread, window_start, window_end, total, updated_at
            FROM label_counters
            ORDER BY label_id ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(counter_from_row).collect())
    }

    /// Sync window of a label.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn window(&self, label_id: &str) -> Result<SyncWindow> {
        let row = sqlx::query(
            r"
            SELECT label_id, unread, window_start, window_end, total, updated_at
            FROM label_counters
            WHERE label_id = ?
            ",
        )
        .bind(label_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| counter_from_row(&row).window).unwrap_or_default())
    }

    /// Extend a label's window after a page fetch.
    ///
    /// `newest` and `total` are only recorded the first time; `oldest` always
    /// moves the end of the window.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn extend_window(
        &self,
        label_id: &str,
        newest: DateTime<Utc>,
        oldest: DateTime<Utc>,
        total: i64,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO label_counters (label_id, window_start, window_end, total, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(label_id) DO UPDATE SET
                window_start = COALESCE(window_start, excluded.window_start),
                total = CASE WHEN window_start IS NULL THEN excluded.total ELSE total END,
                window_end = excluded.window_end,
                updated_at = excluded.updated_at
            ",
        )
        .bind(label_id)
        .bind(newest.to_rfc3339())
        .bind(oldest.to_rfc3339())
        .bind(total)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The id of the last applied remote event, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn event_cursor(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM sync_state WHERE key = ?")
            .bind(EVENT_CURSOR_KEY)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|row| row.get::<String, _>("value"))
            .filter(|id| !id.is_empty()))
    }

    /// Record the id of the last applied remote event.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_event_cursor(&self, event_id: &str) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sync_state (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(EVENT_CURSOR_KEY)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drop every counter, window and the event cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the database transaction fails.
    pub async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM label_counters")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sync_state").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

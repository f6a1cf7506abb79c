//! Counter models.

use chrono::{DateTime, Utc};

/// Range of a label that has been fetched from the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncWindow {
    /// Time of the newest message fetched so far.
    pub start: Option<DateTime<Utc>>,
    /// Time of the oldest message fetched so far.
    pub end: Option<DateTime<Utc>>,
    /// Total number of messages the server reported for the label.
    pub total: i64,
    /// When the window was last extended.
    pub updated_at: Option<DateTime<Utc>>,
}

impl SyncWindow {
    /// Returns true if nothing has been fetched for the label yet.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.start.is_none()
    }
}

/// Unread count and sync window of one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelCounter {
    /// Label id.
    pub label_id: String,
    /// Unread messages, never negative.
    pub unread: u32,
    /// Fetched range.
    pub window: SyncWindow,
}

/// Clamp a signed count into the unread range.
#[must_use]
pub fn clamp_unread(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

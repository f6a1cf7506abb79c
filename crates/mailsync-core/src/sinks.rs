//! Outbound notifications to the rest of the application.

use serde_json::Value;

/// Receives the inbox unread count.
pub trait BadgeSink: Send + Sync {
    /// Show `count` as the application badge.
    fn set_badge(&self, count: u32);
}

/// Schedules local "send failed" reminders.
pub trait NotificationSink: Send + Sync {
    /// Schedule a reminder that `message_id` failed to send.
    fn schedule_send_failed(&self, message_id: &str, detail: &str);

    /// Cancel the reminder for `message_id`.
    fn cancel_send_failed(&self, message_id: &str);

    /// Cancel every scheduled reminder.
    fn cancel_all(&self);
}

/// Receives queue failures worth investigating.
pub trait DiagnosticsSink: Send + Sync {
    /// Report an unexpected failure.
    fn report(&self, context: &str, detail: &str);
}

/// Receives account-level event categories the mail replica does not own.
pub trait AccountSink: Send + Sync {
    /// The user record changed.
    fn update_user(&self, user: &Value);

    /// User settings changed.
    fn update_user_settings(&self, settings: &Value);

    /// Mail settings changed.
    fn update_mail_settings(&self, settings: &Value);

    /// An address was created or changed.
    fn upsert_address(&self, id: &str, address: &Value);

    /// An address was deleted.
    fn delete_address(&self, id: &str);

    /// Used storage changed.
    fn set_used_space(&self, bytes: i64);
}

/// Sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl BadgeSink for NoopSink {
    fn set_badge(&self, _count: u32) {}
}

impl NotificationSink for NoopSink {
    fn schedule_send_failed(&self, _message_id: &str, _detail: &str) {}

    fn cancel_send_failed(&self, _message_id: &str) {}

    fn cancel_all(&self) {}
}

impl DiagnosticsSink for NoopSink {
    fn report(&self, context: &str, detail: &str) {
        tracing::debug!(context, detail, "Diagnostics report dropped");
    }
}

impl AccountSink for NoopSink {
    fn update_user(&self, _user: &Value) {}

    fn update_user_settings(&self, _settings: &Value) {}

    fn update_mail_settings(&self, _settings: &Value) {}

    fn upsert_address(&self, _id: &str, _address: &Value) {}

    fn delete_address(&self, _id: &str) {}

    fn set_used_space(&self, _bytes: i64) {}
}

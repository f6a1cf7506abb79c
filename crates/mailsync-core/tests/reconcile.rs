//! Integration tests for the reconciliation engine.

mod common;

use serde_json::json;

use common::{Harness, inbox_message};
use mailsync_core::replica::{MessageStatus, transact};
use mailsync_core::{ApiResponse, ConnectivityKind, PollOutcome, TransportError};

fn page_body() -> serde_json::Value {
    json!({
        "Messages": [
            {"ID": "r-1", "Subject": "first", "Time": 1_700_000_200, "Unread": 1, "LabelIDs": ["0", "5"]},
            {"ID": "r-2", "Subject": "second", "Time": 1_700_000_100, "Unread": 0, "LabelIDs": ["0", "5"]}
        ],
        "Total": 2
    })
}

fn events(body: serde_json::Value) -> Result<ApiResponse, TransportError> {
    Ok(ApiResponse::new(1000, body))
}

#[tokio::test]
async fn test_full_refresh_without_cursor() {
    let harness = Harness::new().await;
    let transport = &harness.transport;
    transport.always("events/latest", json!({"EventID": "ev-1"}));
    transport.always("messages/by-label", page_body());
    transport.always("messages/count", json!({"Counts": [{"LabelID": "0", "Unread": 1}]}));
    transport.always("labels", json!({"Labels": [{"ID": "work", "Name": "Work", "Exclusive": 0}]}));
    transport.always("contacts", json!({"Contacts": [{"ID": "c-1", "Name": "Bob"}]}));

    let stale = harness.seed(inbox_message("stale", true)).await;
    let counters = harness.sync.counters();
    counters.set_unread("7", 9).await.unwrap();

    let outcome = harness.sync.engine().poll(None).await.unwrap();

    assert_eq!(outcome, PollOutcome::FullRefresh);
    assert!(harness.message(&stale.local_id).await.is_none());
    let first = harness.by_remote("r-1").await.unwrap();
    assert_eq!(first.status, MessageStatus::Materialized);
    assert!(first.unread);
    assert!(harness.by_remote("r-2").await.is_some());

    assert_eq!(counters.event_cursor().await.unwrap().as_deref(), Some("ev-1"));
    assert_eq!(counters.unread("0").await.unwrap(), 1);
    assert_eq!(counters.unread("7").await.unwrap(), 0);
    assert_eq!(counters.window("0").await.unwrap().total, 2);
    assert_eq!(harness.sink.badges.lock().unwrap().first(), Some(&0));
    assert_eq!(harness.sink.last_badge(), Some(1));

    let (label, contact) = transact(harness.replica.as_ref(), |tx| Ok((tx.label("work"), tx.contact("c-1"))))
        .await
        .unwrap();
    assert_eq!(label.unwrap().name, "Work");
    assert_eq!(contact.unwrap().name, "Bob");
}

#[tokio::test]
async fn test_failed_inbox_fetch_keeps_cursor_and_counters() {
    let harness = Harness::new().await;
    let transport = &harness.transport;
    let counters = harness.sync.counters();
    counters.set_event_cursor("ev-0").await.unwrap();
    counters.set_unread("0", 4).await.unwrap();

    transport.push("events", Err(TransportError::api(200, 18001, "bad cursor")));
    transport.always("events/latest", json!({"EventID": "ev-9"}));
    transport.always_fail(
        "messages/by-label",
        TransportError::Connectivity(ConnectivityKind::NoRoute),
    );

    assert!(harness.sync.engine().poll(None).await.is_err());

    assert_eq!(counters.event_cursor().await.unwrap().as_deref(), Some("ev-0"));
    assert_eq!(counters.unread("0").await.unwrap(), 4);
}

#[tokio::test]
async fn test_refresh_flag_forces_full_refresh() {
    let harness = Harness::new().await;
    let transport = &harness.transport;
    harness.sync.counters().set_event_cursor("ev-1").await.unwrap();
    transport.push("events", events(json!({"EventID": "ev-2", "Refresh": 1})));
    transport.always("events/latest", json!({"EventID": "ev-3"}));
    transport.always("messages/by-label", page_body());

    let outcome = harness.sync.engine().poll(None).await.unwrap();

    assert_eq!(outcome, PollOutcome::FullRefresh);
    assert_eq!(
        harness.sync.counters().event_cursor().await.unwrap().as_deref(),
        Some("ev-3")
    );
}

#[tokio::test]
async fn test_incremental_batch_applies_every_category() {
    let harness = Harness::new().await;
    let counters = harness.sync.counters();
    counters.set_event_cursor("ev-1").await.unwrap();
    harness.seed(inbox_message("r-1", true)).await;
    let doomed = harness.seed(inbox_message("r-2", false)).await;

    harness.transport.push(
        "events",
        events(json!({
            "EventID": "ev-2",
            "Refresh": 0,
            "More": 0,
            "Messages": [
                {"ID": "r-1", "Action": 3, "Message": {"Unread": 0}},
                {"ID": "r-2", "Action": 0},
                {"ID": "r-3", "Action": 1, "Message": {"ID": "r-3", "Subject": "new", "Unread": 1, "LabelIDs": ["0", "5"]}}
            ],
            "Labels": [{"ID": "work", "Action": 1, "Label": {"ID": "work", "Name": "Work"}}],
            "Contacts": [{"ID": "c-1", "Action": 1, "Contact": {"ID": "c-1", "Name": "Bob"}}],
            "MessageCounts": [{"LabelID": "0", "Unread": 1}, {"LabelID": "5", "Unread": 1}],
            "UsedSpace": 2048
        })),
    );

    let outcome = harness.sync.engine().poll(None).await.unwrap();

    assert_eq!(
        outcome,
        PollOutcome::Applied {
            messages: 3,
            follow_ups: 0,
            more: false
        }
    );
    assert!(!harness.by_remote("r-1").await.unwrap().unread);
    assert!(harness.message(&doomed.local_id).await.is_none());
    assert_eq!(harness.by_remote("r-3").await.unwrap().subject, "new");
    assert_eq!(counters.event_cursor().await.unwrap().as_deref(), Some("ev-2"));
    assert_eq!(counters.unread("0").await.unwrap(), 1);
    assert_eq!(harness.sink.last_badge(), Some(1));
    assert_eq!(*harness.sink.used_space.lock().unwrap(), Some(2048));

    let (label, contact) = transact(harness.replica.as_ref(), |tx| Ok((tx.label("work"), tx.contact("c-1"))))
        .await
        .unwrap();
    assert!(label.is_some());
    assert!(contact.is_some());
}

#[tokio::test]
async fn test_batch_without_messages_applies_other_categories() {
    let harness = Harness::new().await;
    harness.sync.counters().set_event_cursor("ev-1").await.unwrap();
    harness.transport.push(
        "events",
        events(json!({
            "EventID": "ev-2",
            "Labels": [{"ID": "work", "Action": 1, "Label": {"ID": "work", "Name": "Work"}}]
        })),
    );

    harness.sync.engine().poll(None).await.unwrap();

    let label = transact(harness.replica.as_ref(), |tx| Ok(tx.label("work")))
        .await
        .unwrap();
    assert!(label.is_some());
}

#[tokio::test]
async fn test_bare_event_schedules_metadata_fetch() {
    let harness = Harness::new().await;
    harness.sync.counters().set_event_cursor("ev-1").await.unwrap();
    harness.transport.push(
        "events",
        events(json!({
            "EventID": "ev-2",
            "Messages": [{"ID": "r-9", "Action": 2, "Message": {"Unread": 1}}]
        })),
    );
    harness.transport.always(
        "messages/by-id",
        json!({"Messages": [{"ID": "r-9", "Subject": "Fetched", "Unread": 1}]}),
    );

    let outcome = harness.sync.engine().poll(None).await.unwrap();
    assert!(matches!(outcome, PollOutcome::Applied { follow_ups: 1, .. }));
    assert_eq!(harness.by_remote("r-9").await.unwrap().status, MessageStatus::Raw);

    let report = harness.sync.drain().drain().await.unwrap();

    assert_eq!(report.reads, 1);
    let fetched = harness.by_remote("r-9").await.unwrap();
    assert_eq!(fetched.subject, "Fetched");
    assert_eq!(fetched.status, MessageStatus::Materialized);
}

#[tokio::test]
async fn test_notification_message_is_not_marked_unread() {
    let harness = Harness::new().await;
    harness.sync.counters().set_event_cursor("ev-1").await.unwrap();
    harness.seed(inbox_message("r-1", false)).await;
    harness.transport.push(
        "events",
        events(json!({
            "EventID": "ev-2",
            "Messages": [{"ID": "r-1", "Action": 3, "Message": {"Unread": 1}}]
        })),
    );

    harness.sync.engine().poll(Some("r-1")).await.unwrap();

    assert!(!harness.by_remote("r-1").await.unwrap().unread);
}

#[tokio::test]
async fn test_contacts_refresh_flag() {
    let harness = Harness::new().await;
    let counters = harness.sync.counters();
    counters.set_event_cursor("ev-1").await.unwrap();
    harness.transport.push("events", events(json!({"EventID": "ev-5", "Refresh": 2})));
    harness
        .transport
        .always("contacts", json!({"Contacts": [{"ID": "c-2", "Name": "Carol"}]}));

    let outcome = harness.sync.engine().poll(None).await.unwrap();

    assert_eq!(outcome, PollOutcome::ContactsRefreshed);
    assert_eq!(counters.event_cursor().await.unwrap().as_deref(), Some("ev-5"));
    assert_eq!(harness.transport.count("messages/by-label"), 0);
    let contact = transact(harness.replica.as_ref(), |tx| Ok(tx.contact("c-2")))
        .await
        .unwrap();
    assert!(contact.is_some());
}

#[tokio::test]
async fn test_poll_until_current_follows_more() {
    let harness = Harness::new().await;
    let counters = harness.sync.counters();
    counters.set_event_cursor("ev-1").await.unwrap();
    harness.transport.push("events", events(json!({"EventID": "ev-2", "More": 1})));
    harness.transport.push("events", events(json!({"EventID": "ev-3", "More": 0})));

    let outcome = harness.sync.engine().poll_until_current(None).await.unwrap();

    assert!(matches!(outcome, PollOutcome::Applied { more: false, .. }));
    assert_eq!(harness.transport.count("events"), 2);
    assert_eq!(counters.event_cursor().await.unwrap().as_deref(), Some("ev-3"));
}

#[tokio::test]
async fn test_fetch_label_extends_window() {
    let harness = Harness::new().await;
    harness.transport.always("messages/by-label", page_body());

    let stored = harness.sync.engine().fetch_label("5", 0).await.unwrap();

    assert_eq!(stored, 2);
    let window = harness.sync.counters().window("5").await.unwrap();
    assert_eq!(window.total, 2);
    assert!(window.start > window.end);
    assert_eq!(harness.transport.count("messages/count"), 0);
}

fn detail_body(id: &str, time: i64, body: &str) -> serde_json::Value {
    json!({
        "Message": {
            "ID": id,
            "Subject": "Detailed",
            "Time": time,
            "Unread": 1,
            "LabelIDs": ["0", "5"],
            "Body": body,
            "Attachments": [{"ID": "att-1", "Name": "a.pdf", "MIMEType": "application/pdf", "KeyPackets": "a2V5"}]
        }
    })
}

#[tokio::test]
async fn test_fetch_detail_downloads_body_once() {
    let harness = Harness::new().await;
    let message = harness.seed(inbox_message("r-1", true)).await;
    harness
        .transport
        .always("messages/detail", detail_body("r-1", 1_700_000_000, "armored:body"));
    let engine = harness.sync.engine();

    let fetched = engine.fetch_detail(&message.local_id, false).await.unwrap();

    assert_eq!(fetched.body, "armored:body");
    assert!(fetched.detail_downloaded);
    assert_eq!(fetched.status, MessageStatus::Materialized);
    assert!(fetched.unread);
    let id = message.local_id.clone();
    let attachments = transact(harness.replica.as_ref(), move |tx| Ok(tx.attachments_of(&id)))
        .await
        .unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].remote_id.as_deref(), Some("att-1"));

    engine.fetch_detail(&message.local_id, false).await.unwrap();
    assert_eq!(harness.transport.count("messages/detail"), 1);

    engine.fetch_detail(&message.local_id, true).await.unwrap();
    assert_eq!(harness.transport.count("messages/detail"), 2);
    let id = message.local_id.clone();
    let attachments = transact(harness.replica.as_ref(), move |tx| Ok(tx.attachments_of(&id)))
        .await
        .unwrap();
    assert_eq!(attachments.len(), 1);
}

#[tokio::test]
async fn test_forced_detail_keeps_newer_local_copy() {
    let harness = Harness::new().await;
    let mut message = inbox_message("r-1", false);
    message.body = "armored:local".into();
    message.detail_downloaded = true;
    message.time = mailsync_core::transport::wire::from_unix(1_700_000_500);
    let message = harness.seed(message).await;
    harness
        .transport
        .always("messages/detail", detail_body("r-1", 1_700_000_000, "armored:remote"));

    let fetched = harness.sync.engine().fetch_detail(&message.local_id, true).await.unwrap();

    assert_eq!(fetched.body, "armored:local");
    assert_eq!(harness.message(&message.local_id).await.unwrap().body, "armored:local");
}

#[tokio::test]
async fn test_fetch_detail_of_unknown_message() {
    let harness = Harness::new().await;
    let err = harness.sync.engine().fetch_detail("missing", false).await.unwrap_err();
    assert!(matches!(err, mailsync_core::Error::NotFound(_)));
    assert_eq!(harness.transport.count("messages/detail"), 0);
}

#[tokio::test]
async fn test_open_message_marks_read_after_download() {
    let harness = Harness::new().await;
    let counters = harness.sync.counters();
    counters.set_unread("0", 1).await.unwrap();
    let message = harness.seed(inbox_message("r-1", true)).await;
    harness
        .transport
        .always("messages/detail", detail_body("r-1", 1_700_000_000, "armored:body"));

    let opened = harness.sync.open_message(&message.local_id).await.unwrap();

    assert!(!opened.unread);
    assert_eq!(opened.body, "armored:body");
    assert!(!harness.message(&message.local_id).await.unwrap().unread);
    assert_eq!(counters.unread("0").await.unwrap(), 0);
    harness.sync.drain().drain().await.unwrap();
    assert_eq!(harness.transport.count("messages/read"), 1);
}

#[tokio::test]
async fn test_open_notification_creates_missing_message() {
    let harness = Harness::new().await;
    let counters = harness.sync.counters();
    counters.set_unread("0", 1).await.unwrap();
    harness
        .transport
        .always("messages/detail", detail_body("r-7", 1_700_000_000, "armored:pushed"));

    let opened = harness.sync.open_notification("r-7").await.unwrap();

    let stored = harness.by_remote("r-7").await.unwrap();
    assert_eq!(stored.local_id, opened.local_id);
    assert_eq!(stored.body, "armored:pushed");
    assert!(stored.detail_downloaded);
    assert!(!stored.unread);
    assert_eq!(counters.unread("0").await.unwrap(), 0);
    let queued = harness.sync.queue().list().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, mailsync_core::ActionKind::Read);
}

#[tokio::test]
async fn test_purge_placeholders_refetches_and_drops_unknown() {
    let harness = Harness::new().await;
    let counters = harness.sync.counters();
    counters.set_unread("0", 2).await.unwrap();
    let kept = harness.seed(inbox_message("r-1", true)).await;
    let gone = harness.seed(inbox_message("r-2", true)).await;
    let saved_draft = harness.seed(common::draft("d-1", "bob@example.com")).await;
    let local_draft = harness.seed(mailsync_core::replica::Message::new_local()).await;
    harness.transport.always(
        "messages/by-id",
        json!({"Messages": [{"ID": "r-1", "Subject": "Refetched", "Unread": 1, "LabelIDs": ["0", "5"]}]}),
    );

    let report = harness.sync.engine().purge_placeholders().await.unwrap();

    assert_eq!(report, mailsync_core::PurgeReport { refreshed: 1, removed: 1 });
    let refreshed = harness.message(&kept.local_id).await.unwrap();
    assert_eq!(refreshed.status, MessageStatus::Materialized);
    assert_eq!(refreshed.subject, "Refetched");
    assert!(harness.message(&gone.local_id).await.is_none());
    assert!(harness.message(&saved_draft.local_id).await.is_some());
    assert!(harness.message(&local_draft.local_id).await.is_some());
    assert_eq!(counters.unread("0").await.unwrap(), 1);

    let mut requested: Vec<String> = harness
        .transport
        .calls()
        .into_iter()
        .find_map(|call| match call {
            mailsync_core::ApiRequest::MessagesByIds { ids } => Some(ids),
            _ => None,
        })
        .unwrap();
    requested.sort();
    assert_eq!(requested, ["r-1", "r-2"]);
}

#[tokio::test]
async fn test_failed_purge_deletes_nothing() {
    let harness = Harness::new().await;
    let placeholder = harness.seed(inbox_message("r-1", false)).await;
    harness.transport.always_fail(
        "messages/by-id",
        TransportError::Connectivity(ConnectivityKind::Timeout),
    );

    assert!(harness.sync.engine().purge_placeholders().await.is_err());
    assert!(harness.message(&placeholder.local_id).await.is_some());
}

//! Integration tests for the drain loop and the outcome classifier.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{Harness, MockTransport, draft, inbox_message, internal_keys};
use mailsync_core::{
    Action, ActionKind, ActionTarget, ConnectivityKind, Reachability, SyncConfig, TransportError,
    Verdict,
};

fn read(remote_id: &str) -> Action {
    Action::new(ActionKind::Read, ActionTarget::Remote(remote_id.to_string()))
}

#[tokio::test]
async fn test_single_flight_under_concurrent_drains() {
    let transport = MockTransport::new();
    transport.set_delay(Duration::from_millis(10));
    let harness = Harness::with_transport(transport.clone()).await;
    let queue = harness.sync.queue();
    let drain = harness.sync.drain();

    for i in 0..5 {
        queue.enqueue(&read(&format!("r-{i}"))).await.unwrap();
    }

    let (a, b, c) = tokio::join!(drain.drain(), drain.drain(), drain.drain());
    let completed = a.unwrap().completed + b.unwrap().completed + c.unwrap().completed;

    assert_eq!(completed, 5);
    assert_eq!(transport.count("messages/read"), 5);
    assert_eq!(transport.max_in_flight(), 1);
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_actions_run_in_enqueue_order() {
    let harness = Harness::new().await;
    let queue = harness.sync.queue();
    queue.enqueue(&read("r-1")).await.unwrap();
    queue
        .enqueue(&Action::new(ActionKind::Unread, ActionTarget::Remote("r-2".into())))
        .await
        .unwrap();
    queue
        .enqueue(&Action::new(ActionKind::Empty, ActionTarget::None).with_param1("3"))
        .await
        .unwrap();

    harness.sync.drain().drain().await.unwrap();

    assert_eq!(
        harness.transport.endpoints(),
        ["messages/read", "messages/unread", "messages/empty"]
    );
}

#[tokio::test]
async fn test_send_supersedes_queued_draft_actions() {
    let harness = Harness::new().await;
    harness.transport.keys_for("bob@example.com", internal_keys("bob-key"));
    let draft = harness.seed(draft("d-1", "bob@example.com")).await;
    let target = ActionTarget::Local(draft.local_id.clone());

    let queue = harness.sync.queue();
    queue.enqueue(&Action::new(ActionKind::Send, target.clone())).await.unwrap();
    queue.enqueue(&Action::new(ActionKind::SaveDraft, target.clone())).await.unwrap();
    queue.enqueue(&Action::new(ActionKind::Send, target)).await.unwrap();
    queue.enqueue(&read("r-9")).await.unwrap();

    let report = harness.sync.drain().drain().await.unwrap();

    assert_eq!(report.completed, 2);
    assert_eq!(harness.transport.count("messages/send"), 1);
    assert_eq!(harness.transport.count("drafts/create"), 0);
    assert_eq!(harness.transport.count("drafts/update"), 0);
    assert_eq!(harness.transport.count("messages/read"), 1);
    assert!(queue.is_empty().await.unwrap());

    let sent = harness.message(&draft.local_id).await.unwrap();
    assert!(sent.has_label("2"));
    assert!(!sent.has_label("1"));
}

#[tokio::test]
async fn test_server_error_parks_action() {
    let harness = Harness::new().await;
    harness
        .transport
        .push("messages/read", Err(TransportError::api(500, 0, "internal")));
    let queue = harness.sync.queue();
    let failed = harness.sync.failed();
    queue.enqueue(&read("r-1")).await.unwrap();
    queue.enqueue(&read("r-2")).await.unwrap();

    let report = harness.sync.drain().drain().await.unwrap();

    assert_eq!(report.parked, 1);
    assert_eq!(report.completed, 1);
    assert!(queue.is_empty().await.unwrap());
    let parked = failed.list().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].action.target, ActionTarget::Remote("r-1".into()));
    assert_eq!(parked[0].status, Some(500));

    assert_eq!(harness.sync.drain().retry_failed().await.unwrap(), 1);
    assert!(failed.is_empty().await.unwrap());
    let report = harness.sync.drain().drain().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(harness.transport.count("messages/read"), 3);
}

#[tokio::test]
async fn test_not_found_drops_and_other_status_reports() {
    let harness = Harness::new().await;
    harness
        .transport
        .push("messages/read", Err(TransportError::api(404, 2501, "gone")));
    harness
        .transport
        .push("messages/read", Err(TransportError::api(422, 2001, "invalid")));
    let queue = harness.sync.queue();
    queue.enqueue(&read("r-1")).await.unwrap();
    queue.enqueue(&read("r-2")).await.unwrap();

    let report = harness.sync.drain().drain().await.unwrap();

    assert_eq!(report.dropped, 2);
    assert!(queue.is_empty().await.unwrap());
    let reports = harness.sink.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "read");
}

#[tokio::test]
async fn test_connectivity_failure_pauses_until_restored() {
    let harness = Harness::new().await;
    harness.transport.push(
        "messages/read",
        Err(TransportError::Connectivity(ConnectivityKind::Timeout)),
    );
    let drain = harness.sync.drain();
    let mut reachability = drain.reachability();
    harness.sync.queue().enqueue(&read("r-1")).await.unwrap();

    let report = drain.drain().await.unwrap();
    assert_eq!(report.stopped, Some(Verdict::Offline(ConnectivityKind::Timeout)));
    assert!(drain.is_offline());
    assert!(reachability.has_changed().unwrap());
    assert_eq!(*reachability.borrow_and_update(), Reachability::Degraded);
    assert_eq!(harness.sync.queue().len().await.unwrap(), 1);

    let report = drain.drain().await.unwrap();
    assert_eq!(report.completed, 0);
    assert_eq!(harness.transport.count("messages/read"), 1);

    drain.reachability_restored();
    let report = drain.drain().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(*reachability.borrow(), Reachability::Reachable);
}

#[tokio::test]
async fn test_human_verification_keeps_action() {
    let harness = Harness::new().await;
    harness
        .transport
        .push("messages/read", Err(TransportError::api(200, 9001, "verify")));
    let drain = harness.sync.drain();
    harness.sync.queue().enqueue(&read("r-1")).await.unwrap();

    let report = drain.drain().await.unwrap();
    assert_eq!(report.stopped, Some(Verdict::HumanCheck));
    assert!(report.error.is_some());
    assert!(drain.requires_human_check());
    assert_eq!(harness.sync.queue().len().await.unwrap(), 1);

    drain.human_check_resolved();
    assert_eq!(drain.drain().await.unwrap().completed, 1);
}

#[tokio::test]
async fn test_locked_credentials_block_until_unblocked() {
    let harness = Harness::new().await;
    let message = harness.seed(draft("d-1", "bob@example.com")).await;
    harness.credentials.set_unlocked(false);
    let attachment = harness
        .sync
        .mailbox()
        .add_attachment(&message.local_id, "a.txt", "text/plain", b"hello".to_vec())
        .await
        .unwrap();
    harness.transport.always(
        "attachments/upload",
        serde_json::json!({"Attachment": {"ID": "att-1", "KeyPackets": "a2V5"}}),
    );

    let drain = harness.sync.drain();
    let report = drain.drain().await.unwrap();
    assert_eq!(report.stopped, Some(Verdict::Locked));
    assert!(drain.is_blocked());
    assert_eq!(harness.transport.count("attachments/upload"), 0);

    harness.credentials.set_unlocked(true);
    drain.unblock();
    assert_eq!(drain.drain().await.unwrap().completed, 1);

    let stored = transact_attachment(&harness, &attachment.local_id).await;
    assert_eq!(stored.remote_id.as_deref(), Some("att-1"));
    assert_eq!(stored.key_packet.as_deref(), Some("a2V5"));
    assert!(stored.file_data.is_none());
}

async fn transact_attachment(harness: &Harness, local_id: &str) -> mailsync_core::replica::Attachment {
    let id = local_id.to_string();
    mailsync_core::replica::transact(harness.replica.as_ref(), move |tx| Ok(tx.attachment(&id)))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_read_tasks_run_after_actions() {
    let harness = Harness::new().await;
    let drain = harness.sync.drain();
    let calls_seen = Arc::new(AtomicUsize::new(usize::MAX));
    let idle = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&calls_seen);
    let transport = Arc::clone(&harness.transport);
    drain.schedule_read(Box::pin(async move {
        seen.store(transport.calls().len(), Ordering::SeqCst);
    }));
    let idle_count = Arc::clone(&idle);
    drain.set_idle_callback(move || {
        idle_count.fetch_add(1, Ordering::SeqCst);
    });
    harness.sync.queue().enqueue(&read("r-1")).await.unwrap();

    let report = drain.drain().await.unwrap();

    assert_eq!(report.reads, 1);
    assert!(report.idle);
    assert_eq!(calls_seen.load(Ordering::SeqCst), 1);
    assert_eq!(idle.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_delete_purges_local_row() {
    let harness = Harness::new().await;
    let message = harness.seed(inbox_message("r-1", false)).await;
    harness
        .sync
        .queue()
        .enqueue(&Action::new(ActionKind::Delete, ActionTarget::Remote("r-1".into())))
        .await
        .unwrap();

    harness.sync.drain().drain().await.unwrap();

    assert_eq!(harness.transport.count("messages/delete"), 1);
    assert!(harness.message(&message.local_id).await.is_none());
}

#[tokio::test]
async fn test_background_loop_drains_on_enqueue() {
    let harness = Harness::new().await;
    harness.sync.start();
    harness.sync.queue().enqueue(&read("r-1")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !harness.sync.queue().is_empty().await.unwrap() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(harness.transport.count("messages/read"), 1);
    harness.sync.stop();
}

async fn wait_until_empty(harness: &Harness) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !harness.sync.queue().is_empty().await.unwrap() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_stop_lets_inflight_action_finish() {
    let transport = MockTransport::new();
    transport.set_delay(Duration::from_millis(200));
    let harness = Harness::with_transport(transport.clone()).await;
    harness.sync.start();
    harness.sync.queue().enqueue(&read("r-1")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.sync.stop();

    wait_until_empty(&harness).await;
    assert_eq!(transport.count("messages/read"), 1);

    harness.sync.drain().drain().await.unwrap();
    assert_eq!(transport.count("messages/read"), 1);
}

#[tokio::test]
async fn test_stopped_loop_ignores_new_enqueues() {
    let harness = Harness::new().await;
    harness.sync.start();
    harness.sync.stop();
    tokio::time::sleep(Duration::from_millis(20)).await;

    harness.sync.queue().enqueue(&read("r-1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.transport.count("messages/read"), 0);

    harness.sync.start();
    wait_until_empty(&harness).await;
    assert_eq!(harness.transport.count("messages/read"), 1);
}

#[tokio::test]
async fn test_kept_action_is_retried_without_new_enqueue() {
    let config = SyncConfig {
        retry_delay_ms: 20,
        ..SyncConfig::default()
    };
    let harness = Harness::with_config(MockTransport::new(), config).await;
    harness
        .transport
        .push("messages/read", Err(TransportError::api(200, 500, "busy")));
    harness.sync.start();
    harness.sync.queue().enqueue(&read("r-1")).await.unwrap();

    wait_until_empty(&harness).await;

    assert_eq!(harness.transport.count("messages/read"), 2);
    harness.sync.stop();
}

#[tokio::test]
async fn test_store_failure_is_retried_by_background_loop() {
    let config = SyncConfig {
        retry_delay_ms: 20,
        ..SyncConfig::default()
    };
    let harness = Harness::with_config(MockTransport::new(), config).await;
    let message = harness.seed(inbox_message("r-1", true)).await;
    harness.replica.set_fail_commits(true);
    let queue = harness.sync.queue();
    queue
        .enqueue(&Action::new(ActionKind::Read, ActionTarget::Local(message.local_id.clone())))
        .await
        .unwrap();

    let report = harness.sync.drain().drain().await.unwrap();
    assert_eq!(report.stopped, Some(Verdict::Retain));
    assert_eq!(queue.len().await.unwrap(), 1);

    harness.sync.start();
    tokio::time::sleep(Duration::from_millis(30)).await;
    harness.replica.set_fail_commits(false);

    wait_until_empty(&harness).await;
    assert_eq!(harness.transport.count("messages/read"), 1);
    harness.sync.stop();
}

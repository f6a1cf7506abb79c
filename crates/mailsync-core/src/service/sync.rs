//! Process-level wiring of the sync components.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use super::Mailbox;
use crate::Result;
use crate::config::SyncConfig;
use crate::counter::CounterStore;
use crate::crypto::CryptoProvider;
use crate::drain::{ActionHandlers, DrainLoop};
use crate::identity::{ContactDirectory, CredentialSource};
use crate::queue::{FailedQueue, MutationQueue};
use crate::reconcile::ReconciliationEngine;
use crate::replica::{Message, ReplicaStore, transact};
use crate::send::SendPipeline;
use crate::sinks::{AccountSink, BadgeSink, DiagnosticsSink, NotificationSink};
use crate::transport::Transport;

/// Collaborators supplied by the embedding application.
#[derive(Clone)]
pub struct Collaborators {
    /// Local mailbox replica.
    pub replica: Arc<dyn ReplicaStore>,
    /// Remote mail service.
    pub transport: Arc<dyn Transport>,
    /// Encryption primitives.
    pub crypto: Arc<dyn CryptoProvider>,
    /// Session credentials and keys.
    pub credentials: Arc<dyn CredentialSource>,
    /// Pinned contact lookup.
    pub contacts: Arc<dyn ContactDirectory>,
    /// Application badge.
    pub badge: Arc<dyn BadgeSink>,
    /// Local notifications.
    pub notifications: Arc<dyn NotificationSink>,
    /// Failure reporting.
    pub diagnostics: Arc<dyn DiagnosticsSink>,
    /// Account-level event categories.
    pub account: Arc<dyn AccountSink>,
}

/// Every sync component, wired together.
pub struct MailSync {
    config: Arc<SyncConfig>,
    replica: Arc<dyn ReplicaStore>,
    badge: Arc<dyn BadgeSink>,
    notifications: Arc<dyn NotificationSink>,
    queue: Arc<MutationQueue>,
    failed: Arc<FailedQueue>,
    counters: Arc<CounterStore>,
    pipeline: Arc<SendPipeline>,
    drain: Arc<DrainLoop>,
    engine: Arc<ReconciliationEngine>,
    mailbox: Mailbox,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl MailSync {
    /// Open the durable queues and counters in `database_path` and wire them
    /// to `parts`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub async fn open(database_path: &str, config: SyncConfig, parts: Collaborators) -> Result<Self> {
        let queue = MutationQueue::new(database_path).await?;
        let failed = FailedQueue::new(database_path).await?;
        let counters = CounterStore::new(database_path).await?;
        info!(database_path, "Opened sync state");
        Ok(Self::assemble(queue, failed, counters, config, parts))
    }

    /// Wire `parts` to in-memory queues and counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory databases cannot be created.
    pub async fn in_memory(config: SyncConfig, parts: Collaborators) -> Result<Self> {
        let queue = MutationQueue::in_memory().await?;
        let failed = FailedQueue::in_memory().await?;
        let counters = CounterStore::in_memory().await?;
        Ok(Self::assemble(queue, failed, counters, config, parts))
    }

    fn assemble(
        queue: MutationQueue,
        failed: FailedQueue,
        counters: CounterStore,
        config: SyncConfig,
        parts: Collaborators,
    ) -> Self {
        let config = Arc::new(config);
        let queue = Arc::new(queue);
        let failed = Arc::new(failed);
        let counters = Arc::new(counters);

        let pipeline = Arc::new(SendPipeline::new(
            Arc::clone(&parts.replica),
            Arc::clone(&parts.transport),
            Arc::clone(&parts.crypto),
            Arc::clone(&parts.credentials),
            Arc::clone(&parts.contacts),
            Arc::clone(&parts.notifications),
            Arc::clone(&config),
        ));
        let handlers = ActionHandlers::new(
            Arc::clone(&parts.replica),
            Arc::clone(&parts.transport),
            Arc::clone(&parts.crypto),
            Arc::clone(&parts.credentials),
            Arc::clone(&pipeline),
            Arc::clone(&config),
        );
        let drain = Arc::new(DrainLoop::new(
            Arc::clone(&queue),
            Arc::clone(&failed),
            Arc::new(handlers),
            Arc::clone(&parts.replica),
            Arc::clone(&parts.diagnostics),
            config.codes,
        )
        .with_retry_delay(Duration::from_millis(config.retry_delay_ms)));
        let engine = Arc::new(ReconciliationEngine::new(
            Arc::clone(&parts.replica),
            Arc::clone(&parts.transport),
            Arc::clone(&counters),
            Arc::clone(&drain),
            Arc::clone(&parts.badge),
            Arc::clone(&parts.account),
            Arc::clone(&config),
        ));
        let mailbox = Mailbox::new(
            Arc::clone(&parts.replica),
            Arc::clone(&queue),
            Arc::clone(&counters),
            Arc::clone(&config),
        );

        Self {
            config,
            replica: parts.replica,
            badge: parts.badge,
            notifications: parts.notifications,
            queue,
            failed,
            counters,
            pipeline,
            drain,
            engine,
            mailbox,
            drain_task: Mutex::new(None),
        }
    }

    /// Start the background drain loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = self.drain_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_none_or(JoinHandle::is_finished) {
            *task = Some(Arc::clone(&self.drain).spawn());
        }
    }

    /// Stop the background drain loop after its current pass.
    ///
    /// The action in flight, if any, still completes and is removed from the
    /// queue. A later [`MailSync::start`] spawns a fresh loop.
    pub fn stop(&self) {
        if self
            .drain_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            self.drain.shutdown();
        }
    }

    /// Forget everything tied to the signed-in account.
    ///
    /// Clears both queues, the counters and cursor, the replica, pending
    /// read tasks, scheduled notifications and the badge.
    ///
    /// # Errors
    ///
    /// Returns an error if any store cannot be cleared.
    pub async fn on_signed_out(&self) -> Result<()> {
        self.drain.reset();
        self.queue.clear().await?;
        self.failed.clear().await?;
        self.counters.clear().await?;
        transact(self.replica.as_ref(), |tx| {
            tx.clear_messages();
            tx.clear_labels();
            tx.clear_contacts();
            Ok(())
        })
        .await?;
        self.notifications.cancel_all();
        self.badge.set_badge(0);
        info!("Sync state cleared after sign-out");
        Ok(())
    }

    /// Open a message: download its detail if needed, then mark it read.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] if the message does not exist, or
    /// an error if the fetch or the store fails. The message stays unread
    /// then.
    pub async fn open_message(&self, local_id: &str) -> Result<Message> {
        let message = self.engine.fetch_detail(local_id, false).await?;
        self.mailbox.mark_read(&message.local_id).await?;
        Ok(Message {
            unread: false,
            ..message
        })
    }

    /// Open the message a push notification points at by its remote id.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch or the store fails.
    pub async fn open_notification(&self, remote_id: &str) -> Result<Message> {
        let message = self.engine.fetch_notification_message(remote_id).await?;
        self.mailbox.mark_read(&message.local_id).await?;
        Ok(Message {
            unread: false,
            ..message
        })
    }

    /// The configuration shared by every component.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Local mutation entry points.
    #[must_use]
    pub const fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// The reconciliation engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    /// The drain loop.
    #[must_use]
    pub const fn drain(&self) -> &Arc<DrainLoop> {
        &self.drain
    }

    /// The send pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &Arc<SendPipeline> {
        &self.pipeline
    }

    /// The mutation queue.
    #[must_use]
    pub const fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    /// The failed queue.
    #[must_use]
    pub const fn failed(&self) -> &Arc<FailedQueue> {
        &self.failed
    }

    /// The counter store.
    #[must_use]
    pub const fn counters(&self) -> &Arc<CounterStore> {
        &self.counters
    }
}

impl Drop for MailSync {
    fn drop(&mut self) {
        self.stop();
    }
}

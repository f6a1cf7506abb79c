//! Single-flight drain loop over the mutation queue.
//!
//! One pass repeatedly runs the oldest queued action, classifies its outcome
//! and acts on the verdict. When the durable queue is empty it runs queued
//! read tasks one at a time. A pass holds the drain gate for its whole
//! duration, so no two actions ever execute at once regardless of how many
//! callers trigger a drain.

mod classify;
mod handlers;

pub use classify::{ActionError, Verdict, classify};
pub use handlers::{ActionExecutor, ActionHandlers};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::ErrorCodes;
use crate::queue::{Action, ActionKind, ActionTarget, FailedAction, FailedQueue, MutationQueue};
use crate::replica::{ReplicaStore, transact};
use crate::sinks::DiagnosticsSink;
use crate::transport::{ConnectivityKind, TransportError};

/// Delay before a spawned loop retries an action it had to keep.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// A read-only task queued behind the durable actions.
pub type ReadTask = BoxFuture<'static, ()>;

/// Connectivity as last observed by the drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reachability {
    /// The service answered.
    #[default]
    Reachable,
    /// Requests are timing out.
    Degraded,
    /// No route to the service.
    Unreachable,
}

impl From<ConnectivityKind> for Reachability {
    fn from(kind: ConnectivityKind) -> Self {
        match kind {
            ConnectivityKind::Timeout => Self::Degraded,
            ConnectivityKind::NoRoute | ConnectivityKind::Cancelled => Self::Unreachable,
        }
    }
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Actions that succeeded.
    pub completed: usize,
    /// Actions removed without success.
    pub dropped: usize,
    /// Actions moved to the failed queue.
    pub parked: usize,
    /// Read tasks run.
    pub reads: usize,
    /// Verdict that ended the pass early, if any.
    pub stopped: Option<Verdict>,
    /// Error behind `stopped`.
    pub error: Option<ActionError>,
    /// Both queues were empty when the pass ended.
    pub idle: bool,
}

#[derive(Debug, Default)]
struct DrainState {
    locked: bool,
    offline: bool,
    human_check: bool,
}

impl DrainState {
    const fn paused(&self) -> bool {
        self.locked || self.offline || self.human_check
    }
}

type IdleCallback = Box<dyn Fn() + Send + Sync>;

/// Scheduler over the mutation queue and the read-task queue.
pub struct DrainLoop {
    queue: Arc<MutationQueue>,
    failed: Arc<FailedQueue>,
    executor: Arc<dyn ActionExecutor>,
    replica: Arc<dyn ReplicaStore>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    codes: ErrorCodes,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<DrainState>,
    reads: Mutex<VecDeque<ReadTask>>,
    wake: Arc<Notify>,
    reachability: watch::Sender<Reachability>,
    on_idle: Mutex<Option<IdleCallback>>,
    retry_delay: Duration,
    generation: watch::Sender<u64>,
}

impl DrainLoop {
    /// Creates a drain loop woken by enqueues on `queue`.
    #[must_use]
    pub fn new(
        queue: Arc<MutationQueue>,
        failed: Arc<FailedQueue>,
        executor: Arc<dyn ActionExecutor>,
        replica: Arc<dyn ReplicaStore>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        codes: ErrorCodes,
    ) -> Self {
        let wake = queue.waker();
        let (reachability, _) = watch::channel(Reachability::Reachable);
        Self {
            queue,
            failed,
            executor,
            replica,
            diagnostics,
            codes,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(DrainState::default()),
            reads: Mutex::new(VecDeque::new()),
            wake,
            reachability,
            on_idle: Mutex::new(None),
            retry_delay: DEFAULT_RETRY_DELAY,
            generation: watch::channel(0).0,
        }
    }

    /// Set how long a spawned loop waits before retrying a kept action.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run the loop in the background, draining whenever it is woken.
    ///
    /// A pass that ends on a kept action is retried after the retry delay.
    /// The loop exits between passes once [`DrainLoop::shutdown`] is called
    /// or another loop is spawned.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut generation = self.generation.subscribe();
        let epoch = self.advance_generation();
        tokio::spawn(async move {
            loop {
                let retry = match self.drain().await {
                    Ok(report) => report.stopped == Some(Verdict::Retain),
                    Err(e) => {
                        warn!(error = %e, "Drain pass failed");
                        true
                    }
                };
                if *generation.borrow_and_update() != epoch {
                    break;
                }

                let delay = self.retry_delay;
                let backoff = async move {
                    if retry {
                        tokio::time::sleep(delay).await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                };
                tokio::select! {
                    () = self.wake.notified() => {}
                    () = backoff => debug!("Retrying kept action"),
                    _ = generation.changed() => {}
                }
                if *generation.borrow_and_update() != epoch {
                    break;
                }
            }
            debug!(epoch, "Drain loop stopped");
        })
    }

    /// Ask a spawned loop to exit.
    ///
    /// An action already in flight runs to completion and its outcome is
    /// recorded before the loop exits.
    pub fn shutdown(&self) {
        self.advance_generation();
    }

    fn advance_generation(&self) -> u64 {
        let mut epoch = 0;
        self.generation.send_modify(|generation| {
            *generation += 1;
            epoch = *generation;
        });
        epoch
    }

    /// Run one drain pass inline.
    ///
    /// Waits for any pass already in progress to finish first.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue storage fails; the action stays queued.
    pub async fn drain(&self) -> Result<DrainReport> {
        let _pass = self.gate.lock().await;
        let mut report = DrainReport::default();

        loop {
            if self.with_state(|state| state.paused()) {
                debug!("Drain paused");
                break;
            }

            let (next, unreadable) = self.queue.next_readable().await?;
            for row in &unreadable {
                report.dropped += 1;
                self.diagnostics
                    .report(&row.kind, &format!("unreadable queued action {}", row.id));
            }
            if let Some(action) = next {
                let outcome = self.executor.execute(&action).await;
                let verdict = classify(&outcome, &self.codes);
                self.apply(&action, outcome.err(), &verdict, &mut report).await?;
                if verdict.keeps_action() {
                    report.stopped = Some(verdict);
                    break;
                }
                continue;
            }

            let task = self
                .reads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            if let Some(task) = task {
                task.await;
                report.reads += 1;
                continue;
            }

            report.idle = true;
            if let Some(callback) = self
                .on_idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
            {
                callback();
            }
            break;
        }

        Ok(report)
    }

    async fn apply(
        &self,
        action: &Action,
        error: Option<ActionError>,
        verdict: &Verdict,
        report: &mut DrainReport,
    ) -> Result<()> {
        let detail = error.as_ref().map(ToString::to_string).unwrap_or_default();

        match verdict {
            Verdict::Complete => {
                self.queue.remove(action.id).await?;
                self.post_effect(action).await?;
                report.completed += 1;
                debug!(id = %action.id, kind = %action.kind, "Action completed");
            }
            Verdict::Drop => {
                self.queue.remove(action.id).await?;
                report.dropped += 1;
                info!(id = %action.id, kind = %action.kind, error = %detail, "Action dropped");
            }
            Verdict::DropAndReport => {
                self.queue.remove(action.id).await?;
                report.dropped += 1;
                warn!(id = %action.id, kind = %action.kind, error = %detail, "Action rejected");
                self.diagnostics.report(action.kind.as_str(), &detail);
            }
            Verdict::Park => {
                let (status, code) = match &error {
                    Some(ActionError::Transport(TransportError::Api { status, code, .. })) => {
                        (Some(*status), Some(*code))
                    }
                    _ => (None, None),
                };
                self.failed
                    .park(&FailedAction::new(action.clone(), detail.clone(), status, code))
                    .await?;
                self.queue.remove(action.id).await?;
                report.parked += 1;
                warn!(id = %action.id, kind = %action.kind, error = %detail, "Action parked");
            }
            Verdict::Retain => {
                warn!(id = %action.id, kind = %action.kind, error = %detail, "Action kept for retry");
            }
            Verdict::HumanCheck => {
                self.with_state(|state| state.human_check = true);
                warn!(id = %action.id, "Human verification required");
            }
            Verdict::Offline(kind) => {
                self.with_state(|state| state.offline = true);
                self.reachability.send_replace(Reachability::from(*kind));
                info!(id = %action.id, ?kind, "Service unreachable, pausing drain");
            }
            Verdict::Locked => {
                self.with_state(|state| state.locked = true);
                info!(id = %action.id, "Credentials locked, pausing drain");
            }
        }

        if verdict.keeps_action() {
            report.error = error;
        }
        Ok(())
    }

    async fn post_effect(&self, action: &Action) -> Result<()> {
        match action.kind {
            ActionKind::Send => {
                let removed = self
                    .queue
                    .remove_matching(&action.target, &[ActionKind::SaveDraft, ActionKind::Send])
                    .await?;
                if removed > 0 {
                    debug!(action_target = action.target.id(), removed, "Dropped superseded draft actions");
                }
            }
            ActionKind::Delete => {
                if let ActionTarget::Remote(remote_id) = &action.target {
                    let remote_id = remote_id.clone();
                    transact(self.replica.as_ref(), move |tx| {
                        if let Some(message) = tx.message_by_remote_id(&remote_id) {
                            tx.delete_message(&message.local_id);
                        }
                        Ok(())
                    })
                    .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Queue a read-only task to run once no action is pending.
    pub fn schedule_read(&self, task: ReadTask) {
        self.reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
        self.wake.notify_one();
    }

    /// Register a callback invoked whenever a pass leaves both queues empty.
    pub fn set_idle_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_idle.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    /// Clear the locked state after credentials were re-validated.
    pub fn unblock(&self) {
        self.with_state(|state| state.locked = false);
        self.wake.notify_one();
    }

    /// Clear the offline state after connectivity returned.
    pub fn reachability_restored(&self) {
        self.with_state(|state| state.offline = false);
        self.reachability.send_replace(Reachability::Reachable);
        self.wake.notify_one();
    }

    /// Clear the human-verification state.
    pub fn human_check_resolved(&self) {
        self.with_state(|state| state.human_check = false);
        self.wake.notify_one();
    }

    /// Returns true while the drain waits for a human verification.
    #[must_use]
    pub fn requires_human_check(&self) -> bool {
        self.with_state(|state| state.human_check)
    }

    /// Returns true while credentials are locked.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.with_state(|state| state.locked)
    }

    /// Returns true while the service is unreachable.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.with_state(|state| state.offline)
    }

    /// Subscribe to connectivity changes.
    #[must_use]
    pub fn reachability(&self) -> watch::Receiver<Reachability> {
        self.reachability.subscribe()
    }

    /// Move every parked action back to the tail of the mutation queue.
    ///
    /// # Errors
    ///
    /// Returns an error if either queue cannot be accessed.
    pub async fn retry_failed(&self) -> Result<usize> {
        let parked = self.failed.list().await?;
        for failed in &parked {
            self.queue.enqueue(&failed.action).await?;
            self.failed.remove(failed.action.id).await?;
        }
        if !parked.is_empty() {
            info!(count = parked.len(), "Requeued failed actions");
        }
        Ok(parked.len())
    }

    /// Forget pending read tasks and every paused state.
    pub fn reset(&self) {
        self.reads.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.with_state(|state| *state = DrainState::default());
        self.reachability.send_replace(Reachability::Reachable);
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut DrainState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

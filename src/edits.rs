//! Debounced agent-edit queue.
//!
//! Programmatic `queue_file_change` calls coalesce per path (last write
//! wins) behind a cancellable debounce timer with a fire-immediately
//! capability. `wait_for_pending_edits` forces an immediate flush and
//! re-registers itself when new edits arrive during the wait, resolving
//! `false` on expiry without failing the caller. Causal order per path is
//! preserved: a flush batch completes before the next one starts.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Kind of a programmatic file change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Created,
    Updated,
    Deleted,
}

/// Handler invoked with each coalesced flush batch.
pub type FlushHandler =
    Arc<dyn Fn(Vec<(PathBuf, EditKind)>) -> BoxFuture<'static, crate::Result<()>> + Send + Sync>;

/// A one-shot cancellable timer with a fire-immediately capability.
pub struct DebounceHandle {
    fire: Option<tokio::sync::oneshot::Sender<()>>,
    cancel: CancellationToken,
}

impl DebounceHandle {
    /// Cancel the timer; the action never runs.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fire the action now instead of waiting out the delay.
    pub fn fire_now(&mut self) {
        if let Some(tx) = self.fire.take() {
            let _ = tx.send(());
        }
    }
}

/// Run `action` after `delay`, unless cancelled or fired early.
pub fn debounce<F>(delay: Duration, action: F) -> DebounceHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let (fire_tx, fire_rx) = tokio::sync::oneshot::channel::<()>();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
            _ = fire_rx => {}
        }
        action.await;
    });
    DebounceHandle {
        fire: Some(fire_tx),
        cancel,
    }
}

struct QueueState {
    pending: HashMap<PathBuf, EditKind>,
    order: Vec<PathBuf>,
    timer: Option<DebounceHandle>,
    flushing: bool,
}

struct QueueInner {
    debounce_ms: u64,
    handler: FlushHandler,
    state: parking_lot::Mutex<QueueState>,
    idle: tokio::sync::Notify,
}

/// The debounced, coalescing edit queue.
#[derive(Clone)]
pub struct EditQueue {
    inner: Arc<QueueInner>,
}

impl EditQueue {
    pub fn new(debounce_ms: u64, handler: FlushHandler) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                debounce_ms,
                handler,
                state: parking_lot::Mutex::new(QueueState {
                    pending: HashMap::new(),
                    order: Vec::new(),
                    timer: None,
                    flushing: false,
                }),
                idle: tokio::sync::Notify::new(),
            }),
        }
    }

    /// Queue a change; per-path, the last write wins. Each call restarts
    /// the debounce window.
    pub fn queue_file_change(&self, path: PathBuf, kind: EditKind) {
        let mut state = self.inner.state.lock();
        if state.pending.insert(path.clone(), kind).is_none() {
            state.order.push(path);
        }
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        let inner = Arc::clone(&self.inner);
        state.timer = Some(debounce(
            Duration::from_millis(self.inner.debounce_ms),
            async move {
                run_flush(inner).await;
            },
        ));
    }

    /// Whether any edit is queued or a flush is in progress.
    pub fn has_pending(&self) -> bool {
        let state = self.inner.state.lock();
        !state.pending.is_empty() || state.flushing
    }

    /// Wait until every queued edit (including ones arriving during the
    /// wait) has flushed. Forces an immediate flush of whatever is queued.
    /// Returns `false` on expiry; `timeout_ms` of 0 waits forever.
    pub async fn wait_for_pending_edits(&self, timeout_ms: u64) -> bool {
        let deadline =
            (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        loop {
            let spawn_flush = {
                let mut state = self.inner.state.lock();
                if state.pending.is_empty() && !state.flushing {
                    return true;
                }
                if let Some(timer) = state.timer.as_mut() {
                    // Cancel the debounce wait, flush immediately.
                    timer.fire_now();
                    false
                } else {
                    // Timer already consumed; make sure a flush is running.
                    !state.flushing
                }
            };
            if spawn_flush {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { run_flush(inner).await });
            }

            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.has_pending() {
                return true;
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    if tokio::time::timeout(deadline - now, notified).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Flush whatever is queued and wait for completion (shutdown path).
    pub async fn shutdown(&self) {
        self.wait_for_pending_edits(0).await;
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }
}

/// Drain-and-flush loop. Batches that arrive while a flush runs are
/// processed before the queue reports idle, preserving causal order per
/// path across batches.
async fn run_flush(inner: Arc<QueueInner>) {
    loop {
        let batch: Vec<(PathBuf, EditKind)> = {
            let mut state = inner.state.lock();
            if state.flushing {
                // The running flush loops and will pick these up.
                return;
            }
            if state.pending.is_empty() {
                state.timer = None;
                inner.idle.notify_waiters();
                return;
            }
            state.flushing = true;
            state.timer = None;
            let order: Vec<PathBuf> = state.order.drain(..).collect();
            order
                .into_iter()
                .filter_map(|path| state.pending.remove(&path).map(|kind| (path, kind)))
                .collect()
        };

        debug!(edits = batch.len(), "flushing edit batch");
        if let Err(e) = (inner.handler)(batch).await {
            error!(error = %e, "edit flush failed");
        }

        let mut state = inner.state.lock();
        state.flushing = false;
        if state.pending.is_empty() {
            inner.idle.notify_waiters();
            return;
        }
        // New edits arrived during the flush; run them now rather than
        // re-arming the debounce, so waiters observe them.
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }
}

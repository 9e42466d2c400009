//! Actor runtime: supervised spawning and bounded, best-effort mailboxes.
//!
//! Every actor owns a [`CancellationToken`] derived from its parent's. The
//! actor's loop runs as its own task under [`spawn_supervised`]; when the
//! loop returns or panics, the token is cancelled so that anything watching
//! the actor's lifetime (the Stage watchdog, an OutConn watching its Socket
//! Receiver) observes the death.
//!
//! Actors consume themselves in `run(self)`, so a given instance can only
//! ever run once.

pub mod message;

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Run `fut` as actor `name`, cancelling `token` when it ends.
///
/// A panic inside `fut` is caught at the task boundary, logged, and turned
/// into cancellation of this actor only.
pub fn spawn_supervised<F>(name: &'static str, token: CancellationToken, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let inner = tokio::spawn(fut);

        match inner.await {
            Ok(()) => tracing::trace!(actor = name, "actor stopped"),
            Err(e) if e.is_panic() => {
                tracing::error!(
                    actor = name,
                    panic = %panic_message(&*e.into_panic()),
                    "actor panicked"
                );
            }
            Err(e) => tracing::debug!(actor = name, "actor aborted: {e}"),
        }

        token.cancel();
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Counter of messages that could not be delivered, shared across mailboxes.
#[derive(Debug, Default)]
pub struct DropCounter(AtomicU64);

impl DropCounter {
    /// Current total.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sending half of an actor inbox.
///
/// [`Mailbox::post`] never blocks the caller: when the queue is full it
/// hands the message to one background attempt bounded by the send timeout.
/// Every undeliverable message is counted, both on this mailbox and on the
/// shared [`DropCounter`].
pub struct Mailbox<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    send_timeout: Duration,
    dropped: Arc<AtomicU64>,
    total: Arc<DropCounter>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            send_timeout: self.send_timeout,
            dropped: Arc::clone(&self.dropped),
            total: Arc::clone(&self.total),
        }
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.name)
            .field("capacity", &self.tx.capacity())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Create a bounded inbox.
pub fn mailbox<T>(
    name: &'static str,
    capacity: usize,
    send_timeout: Duration,
    total: Arc<DropCounter>,
) -> (Mailbox<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        Mailbox {
            name,
            tx,
            send_timeout,
            dropped: Arc::new(AtomicU64::new(0)),
            total,
        },
        rx,
    )
}

impl<T: Send + 'static> Mailbox<T> {
    /// Deliver `msg`, falling back to a bounded background attempt when the
    /// queue is full.
    pub fn post(&self, msg: T) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                let this = self.clone();
                tokio::spawn(async move {
                    if this.tx.send_timeout(msg, this.send_timeout).await.is_err() {
                        this.record_drop("timed out");
                    }
                });
            }
            Err(TrySendError::Closed(_)) => self.record_drop("closed"),
        }
    }

    /// Deliver `msg` only if there is room right now.
    ///
    /// Returns false (and counts a drop) otherwise.
    pub fn try_post(&self, msg: T) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.record_drop("full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.record_drop("closed");
                false
            }
        }
    }

    /// Deliver `msg`, waiting up to the send timeout. For callers that are
    /// already async and want ordering with their own subsequent work.
    pub async fn send(&self, msg: T) -> bool {
        if self.tx.send_timeout(msg, self.send_timeout).await.is_err() {
            self.record_drop("timed out");
            return false;
        }
        true
    }
}

impl<T> Mailbox<T> {
    /// Messages dropped by this mailbox.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// True once the receiving actor has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn record_drop(&self, reason: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.total.incr();
        tracing::warn!(mailbox = self.name, reason, "dropped actor message");
    }
}

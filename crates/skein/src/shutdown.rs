//! Counted shutdown.
//!
//! `close` starts the latch at one, for the close call itself. Every resource
//! being closed acquires before its close starts and releases when it
//! completes; the close call releases its own count last. The [`Closed`]
//! future resolves when the count reaches zero.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

pub(crate) struct ShutdownLatch {
    owner: String,
    pending: AtomicIsize,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

impl ShutdownLatch {
    pub(crate) fn new(owner: impl Into<String>) -> (Arc<Self>, Closed) {
        let (tx, rx) = oneshot::channel();
        let latch = Arc::new(Self {
            owner: owner.into(),
            pending: AtomicIsize::new(1),
            done: Mutex::new(Some(tx)),
        });
        (latch, Closed { rx })
    }

    pub(crate) fn acquire(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self, what: &'static str) {
        let remaining = self.pending.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::trace!(owner = %self.owner, what, remaining, "shutdown step finished");
        if remaining > 0 {
            return;
        }
        if remaining < 0 {
            tracing::error!(
                owner = %self.owner,
                what,
                pending = remaining,
                "shutdown counter went negative; a resource reported completion twice"
            );
            return;
        }
        if let Some(done) = self.done.lock().take() {
            tracing::debug!(owner = %self.owner, "channel closed");
            let _ = done.send(());
        }
    }

    #[cfg(test)]
    fn pending(&self) -> isize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Resolves once a channel and everything it owned have finished closing.
#[must_use = "dropping Closed does not cancel the close, but loses the completion signal"]
#[derive(Debug)]
pub struct Closed {
    rx: oneshot::Receiver<()>,
}

impl Future for Closed {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // A dropped sender means the latch itself went away; nothing is left
        // to wait for.
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

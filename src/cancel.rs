//! Cooperative cancellation for in-flight pipeline work.
//!
//! A [`CancelHandle`] is held by whoever may cancel (batch cancel requests,
//! shutdown); [`Cancellation`] is passed down into stage handlers and the
//! LLM dispatcher, which check it at every suspension point and abort
//! outbound HTTP requests once it fires.

use std::sync::Arc;

use tokio::sync::watch;

/// Sender side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Create a linked handle/token pair.
    pub fn new() -> (Self, Cancellation) {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let token = Cancellation {
            rx,
            _keepalive: Some(Arc::clone(&tx)),
        };
        (Self { tx }, token)
    }

    /// Fire cancellation. Idempotent; all linked tokens observe it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether cancellation has already been fired.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiver side of a cancellation pair, cheap to clone.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
    // Keeps the channel alive so `cancelled()` never sees a closed sender.
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl Cancellation {
    /// A token that never fires. Useful for one-shot CLI paths and tests.
    pub fn none() -> Self {
        let (handle, token) = CancelHandle::new();
        drop(handle); // keepalive inside the token holds the channel open
        token
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation fires. Pends forever if it never does,
    /// so this is safe to use inside `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without firing: cancellation can never happen.
                std::future::pending::<()>().await;
            }
        }
    }
}

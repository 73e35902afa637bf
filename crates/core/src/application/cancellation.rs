// Cooperative cancellation for running batches

use tokio::sync::watch;

/// Cancellation signal observed by batch workers
#[derive(Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<Option<String>>,
}

impl CancellationToken {
    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Reason given with the cancellation request
    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Wait for the cancellation signal
    pub async fn cancelled(&mut self) {
        while !self.is_cancelled() {
            if self.rx.changed().await.is_err() {
                // Sender dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }

    /// A token that is never cancelled
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }
}

/// Cancellation sender
pub struct CancellationHandle {
    tx: watch::Sender<Option<String>>,
}

impl CancellationHandle {
    /// Signal cancellation to all workers; the first reason wins
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Create a cancellation channel
pub fn cancellation_channel() -> (CancellationHandle, CancellationToken) {
    let (tx, rx) = watch::channel(None);
    (CancellationHandle { tx }, CancellationToken { rx })
}

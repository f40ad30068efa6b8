//! Cooperative cancellation threaded through every pipeline step.
//!
//! A [`CancellationToken`] is cheap to clone and is checked (or raced
//! against) at each suspension point. Cancelling the token cancels all
//! child voice calls and any in-flight adapter request.

use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Shared cancellation flag.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    /// Create a new, un-cancelled token.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        // Receivers observe the new value; send can only fail if every
        // receiver is gone, which makes cancellation moot.
        let _ = self.tx.send(true);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Error out if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve when cancellation is requested.
    ///
    /// Intended for `tokio::select!` races against in-flight work.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling; treat as never-cancelled.
                futures::future::pending::<()>().await;
            }
        }
    }

    /// Race a future against cancellation.
    pub async fn guard<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancelled() => Err(Error::Cancelled),
            out = fut => out,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_propagates_to_clones() {
        let token = CancellationToken::new();
        let child = token.clone();
        assert!(!child.is_cancelled());

        token.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(child.check(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_guard_cancels_in_flight_future() {
        let token = CancellationToken::new();
        let guard_token = token.clone();

        let task = tokio::spawn(async move {
            guard_token
                .guard(async {
                    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                    Ok::<_, Error>(42)
                })
                .await
        });

        token.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_guard_passes_through_completion() {
        let token = CancellationToken::new();
        let out = token.guard(async { Ok::<_, Error>("done") }).await.unwrap();
        assert_eq!(out, "done");
    }
}

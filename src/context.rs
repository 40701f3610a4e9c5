//! Cancellation and deadlines for blocking operations.
//!
//! Every blocking call on the network or the DHT takes an [`OpContext`].
//! A context may carry a deadline, any number of cancel signals, both, or
//! neither ([`OpContext::background`]). When it fires, the operation
//! returns [`Interrupted::Cancelled`] or [`Interrupted::TimedOut`] depending
//! on which signal fired first.

use std::future::Future;

use futures::future::select_all;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    TimedOut,
}

#[derive(Clone, Debug, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancels: Vec<watch::Receiver<bool>>,
}

/// Fires the cancel signal of the contexts derived from it.
///
/// Dropping a `Canceller` without calling [`Canceller::cancel`] leaves its
/// contexts running.
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl OpContext {
    /// A context that never fires.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    pub fn with_cancel() -> (Self, Canceller) {
        Self::background().child_with_cancel()
    }

    /// Derive a context that also expires after `timeout`. The earlier of the
    /// two deadlines wins.
    pub fn timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancels: self.cancels.clone(),
        }
    }

    /// Derive a context with an additional cancel signal.
    pub fn child_with_cancel(&self) -> (Self, Canceller) {
        let (tx, rx) = watch::channel(false);
        let mut cancels = self.cancels.clone();
        cancels.push(rx);
        (
            Self {
                deadline: self.deadline,
                cancels,
            },
            Canceller { tx },
        )
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check. Cancellation takes precedence over an elapsed
    /// deadline.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.cancels.iter().any(|rx| *rx.borrow()) {
            return Err(Interrupted::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Interrupted::TimedOut);
            }
        }
        Ok(())
    }

    /// Resolves once the context fires.
    pub async fn done(&self) -> Interrupted {
        if let Err(reason) = self.check() {
            return reason;
        }
        let cancelled = wait_any_cancel(self.cancels.clone());
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = cancelled => Interrupted::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Interrupted::TimedOut,
                }
            }
            None => {
                cancelled.await;
                Interrupted::Cancelled
            }
        }
    }

    /// Drive `fut` to completion unless the context fires first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            output = fut => Ok(output),
        }
    }
}

async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    let fired = rx.wait_for(|cancelled| *cancelled).await.is_ok();
    if !fired {
        // Sender dropped without cancelling.
        std::future::pending::<()>().await;
    }
}

async fn wait_any_cancel(cancels: Vec<watch::Receiver<bool>>) {
    if cancels.is_empty() {
        return std::future::pending::<()>().await;
    }
    let waits: Vec<_> = cancels
        .into_iter()
        .map(|rx| Box::pin(wait_cancelled(rx)))
        .collect();
    select_all(waits).await;
}

//! Ambient cancellation token threaded through every remote call

use crate::error::{EngineError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Cloneable cancellation handle
///
/// Cancellation is sticky: once fired it stays fired, and every clone
/// observes it. Components check `ensure_active` between pipeline stages
/// and select on `cancelled` around remote calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token; idempotent
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Error out if the token has fired
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve when the token fires; resolves immediately if already fired
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_for_every_clone() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.ensure_active().is_ok());

        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(
            clone.ensure_active(),
            Err(EngineError::Cancelled)
        ));
        // Resolves without blocking once fired
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}

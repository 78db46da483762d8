//! One-shot "closed once" gates.
//!
//! A [`Gate`] starts open and can be closed exactly once; every later close is
//! a no-op. Waiters are released when the gate closes, and a waiter arriving
//! after the close returns immediately. Clones share the same gate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Gate {
    closed: Arc<watch::Sender<bool>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            closed: Arc::new(tx),
        }
    }

    /// Close the gate. Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Block until the gate is closed. No timeout.
    pub async fn wait(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so this cannot observe a drop.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Like [`Gate::wait`] but gives up after `timeout`; returns whether the gate closed.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_close_is_noop() {
        let gate = Gate::new();
        assert!(!gate.is_closed());
        assert!(gate.close());
        assert!(!gate.close());
        assert!(gate.is_closed());
    }

    #[test]
    fn test_clones_share_state() {
        let gate = Gate::new();
        let other = gate.clone();
        other.close();
        assert!(gate.is_closed());
        assert!(!gate.close());
    }

    #[tokio::test]
    async fn test_wait_released_by_close() {
        let gate = Gate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        gate.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .expect("waiter task");
    }

    #[tokio::test]
    async fn test_wait_after_close_returns_immediately() {
        let gate = Gate::new();
        gate.close();
        assert!(gate.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_timeout_on_open_gate() {
        let gate = Gate::new();
        assert!(!gate.wait_timeout(Duration::from_millis(10)).await);
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A cloneable cancellation token.
///
/// Once triggered it stays triggered; `wait()` returns immediately for
/// every waiter, current and future. Used to cancel in-flight hub
/// requests and to stop desired-property watchers during draining.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the interrupt, waking every waiter.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Wait until the interrupt is triggered.
    pub async fn wait(&self) {
        loop {
            if self.is_triggered() {
                return;
            }
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            // register before the flag re-check so a concurrent
            // trigger() cannot slip between check and sleep
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_wait_returns_after_trigger() {
        let interrupt = Interrupt::new();

        let waiter = interrupt.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::task::yield_now().await;
        interrupt.trigger();

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake after trigger")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_on_already_triggered() {
        let interrupt = Interrupt::new();
        interrupt.trigger();

        timeout(Duration::from_millis(100), interrupt.wait())
            .await
            .expect("wait should return immediately");
        assert!(interrupt.is_triggered());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();

        clone.trigger();
        assert!(interrupt.is_triggered());
    }

    #[tokio::test]
    async fn test_untriggered_does_not_return() {
        let interrupt = Interrupt::new();

        let result = timeout(Duration::from_millis(50), interrupt.wait()).await;
        assert!(result.is_err());
    }
}

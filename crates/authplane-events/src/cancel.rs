//! Cooperative cancellation for long-running loops.
//!
//! A [`CancelHandle`] owns the signal; any number of [`CancelToken`] clones
//! observe it. Dropping the handle without calling [`CancelHandle::cancel`]
//! detaches the tokens: they never fire afterwards.

use std::future;

use tokio::sync::watch;

/// Owning side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    /// Create a fresh, un-cancelled signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Produce a token observing this handle.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            receiver: self.sender.subscribe(),
        }
    }

    /// Fire the signal. Calling this more than once is harmless.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Whether [`Self::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    #[must_use]
    pub fn never() -> Self {
        let (_, receiver) = watch::channel(false);
        Self { receiver }
    }

    /// Whether the owning handle has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once the owning handle fires.
    ///
    /// Pends forever when the handle was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn cancel_wakes_every_token() {
        let handle = CancelHandle::new();
        let first = handle.token();
        let second = first.clone();
        assert!(!first.is_cancelled());

        handle.cancel();
        handle.cancel();

        timeout(Duration::from_millis(100), first.cancelled())
            .await
            .expect("first token should observe cancellation");
        timeout(Duration::from_millis(100), second.cancelled())
            .await
            .expect("second token should observe cancellation");
        assert!(second.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn token_created_after_cancel_is_already_cancelled() {
        let handle = CancelHandle::new();
        handle.cancel();
        let late = handle.token();
        assert!(late.is_cancelled());
        timeout(Duration::from_millis(50), late.cancelled())
            .await
            .expect("late token should resolve immediately");
    }

    #[tokio::test]
    async fn dropped_handle_detaches_tokens() {
        let handle = CancelHandle::new();
        let token = handle.token();
        drop(handle);
        assert!(!token.is_cancelled());
        assert!(
            timeout(Duration::from_millis(50), token.cancelled())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn never_token_stays_pending() {
        let token = CancelToken::never();
        assert!(
            timeout(Duration::from_millis(20), token.cancelled())
                .await
                .is_err()
        );
    }
}

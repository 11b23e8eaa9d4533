//! Two-phase cooperative shutdown. [Signaller::close_at_leisure] asks
//! components to finish their current work and exit; [Signaller::close_now]
//! additionally cancels work in flight. The phases fire at most once and
//! only in that order. Components report back through
//! [Signaller::shutdown_complete].

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct Signaller {
    at_leisure: CancellationToken,
    now: CancellationToken,
    stopped: CancellationToken,
}

impl Signaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals listeners to finish in-flight work and exit.
    pub fn close_at_leisure(&self) {
        self.at_leisure.cancel();
    }

    /// Signals listeners to abandon in-flight work. Implies at-leisure.
    pub fn close_now(&self) {
        self.at_leisure.cancel();
        self.now.cancel();
    }

    pub fn should_close_at_leisure(&self) -> bool {
        self.at_leisure.is_cancelled()
    }

    pub fn should_close_now(&self) -> bool {
        self.now.is_cancelled()
    }

    /// Resolves once the at-leisure phase has fired.
    pub async fn closed_at_leisure(&self) {
        self.at_leisure.cancelled().await;
    }

    /// Resolves once the immediate phase has fired.
    pub async fn closed_now(&self) {
        self.now.cancelled().await;
    }

    /// A token cancelled by the at-leisure phase, for deriving per-operation
    /// contexts.
    pub fn at_leisure_child_token(&self) -> CancellationToken {
        self.at_leisure.child_token()
    }

    /// Marks the component as fully stopped, releasing
    /// [Signaller::wait_for_stop] callers.
    pub fn shutdown_complete(&self) {
        self.stopped.cancel();
    }

    pub fn has_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Blocks until the component reports completion, or returns
    /// [Error::Timeout] once the timeout elapses.
    pub async fn wait_for_stop(&self, timeout: Duration) -> Result<()> {
        tokio::select! {
            _ = self.stopped.cancelled() => Ok(()),
            _ = tokio::time::sleep(timeout) => Err(Error::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn phases_fire_in_order() {
        let sig = Signaller::new();
        assert!(!sig.should_close_at_leisure());
        assert!(!sig.should_close_now());

        sig.close_at_leisure();
        assert!(sig.should_close_at_leisure());
        assert!(!sig.should_close_now());

        sig.close_now();
        assert!(sig.should_close_now());
    }

    #[tokio::test]
    async fn close_now_implies_at_leisure() {
        let sig = Signaller::new();
        sig.close_now();
        assert!(sig.should_close_at_leisure());
        sig.closed_at_leisure().await;
        sig.closed_now().await;
    }

    #[tokio::test]
    async fn wait_for_stop_returns_once_complete() {
        let sig = Signaller::new();
        let waiter = sig.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_stop(Duration::from_secs(1)).await
        });
        sig.shutdown_complete();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn wait_for_stop_times_out() {
        let sig = Signaller::new();
        let err = sig.wait_for_stop(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn child_token_follows_at_leisure() {
        let sig = Signaller::new();
        let token = sig.at_leisure_child_token();
        assert!(!token.is_cancelled());
        sig.close_at_leisure();
        token.cancelled().await;
    }
}

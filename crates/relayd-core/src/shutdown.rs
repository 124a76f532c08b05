//! Shared shutdown request channel.
//!
//! Any task may request shutdown: fatal component errors through
//! [`ShutdownTrigger::fire`], the OS signal path through
//! [`ShutdownTrigger::terminate`]. The first error recorded is the cause the
//! daemon reports; later ones are only logged.

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::DaemonError;

struct TriggerInner {
    token: CancellationToken,
    cause: Mutex<Option<DaemonError>>,
}

#[derive(Clone)]
pub struct ShutdownTrigger {
    inner: Arc<TriggerInner>,
}

impl std::fmt::Debug for ShutdownTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownTrigger")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                token: CancellationToken::new(),
                cause: Mutex::new(None),
            }),
        }
    }

    /// Report a fatal error and request shutdown.
    pub fn fire(&self, err: DaemonError) {
        {
            let mut cause = self.cause();
            if cause.is_none() {
                error!(error = %err, "fatal error, shutting down");
                *cause = Some(err);
            } else {
                warn!(error = %err, "further fatal error after shutdown was requested");
            }
        }
        self.inner.token.cancel();
    }

    /// Request a clean shutdown.
    pub fn terminate(&self) {
        if !self.inner.token.is_cancelled() {
            info!("termination requested");
        }
        self.inner.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested by any path.
    pub async fn triggered(&self) {
        self.inner.token.cancelled().await
    }

    pub fn has_error(&self) -> bool {
        self.cause().is_some()
    }

    /// Remove and return the recorded cause, if any.
    pub fn take_cause(&self) -> Option<DaemonError> {
        self.cause().take()
    }

    fn cause(&self) -> std::sync::MutexGuard<'_, Option<DaemonError>> {
        self.inner
            .cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_error_wins() {
        let trigger = ShutdownTrigger::new();
        trigger.fire(DaemonError::Receive("first".into()));
        trigger.fire(DaemonError::Receive("second".into()));
        trigger.triggered().await;

        let cause = trigger.take_cause().unwrap();
        assert!(cause.to_string().contains("first"));
        assert!(trigger.take_cause().is_none());
    }

    #[tokio::test]
    async fn terminate_has_no_cause() {
        let trigger = ShutdownTrigger::new();
        let waiter = {
            let t = trigger.clone();
            tokio::spawn(async move { t.triggered().await })
        };
        trigger.terminate();
        waiter.await.unwrap();
        assert!(trigger.is_triggered());
        assert!(!trigger.has_error());
    }

    #[test]
    fn error_after_terminate_is_still_recorded() {
        let trigger = ShutdownTrigger::new();
        trigger.terminate();
        trigger.fire(DaemonError::Facts("late".into()));
        assert!(trigger.has_error());
    }
}

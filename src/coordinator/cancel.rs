//! Cancellation for coordinator runs
//!
//! Two independent signals feed a run:
//! - the stepdown token, owned by the hosting service and fired when this
//!   node stops being primary
//! - the abort flag, owned by the instance and set by an explicit abort
//!
//! Both are `tokio::sync::watch` channels so they can be polled at phase
//! boundaries and awaited during backoff sleeps.

use std::fmt;
use tokio::sync::watch;

/// Sender side of a stepdown token. One source per primary term.
#[derive(Debug)]
pub struct StepdownSource {
    tx: watch::Sender<bool>,
}

impl StepdownSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> StepdownToken {
        StepdownToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the token; every run holding it stops at its next phase boundary.
    pub fn step_down(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stepped_down(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for StepdownSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side handed to `run`.
#[derive(Debug, Clone)]
pub struct StepdownToken {
    rx: watch::Receiver<bool>,
}

impl StepdownToken {
    pub fn is_stepped_down(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token fires. Never resolves if the source is
    /// dropped without firing.
    pub async fn stepped_down(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|s| *s).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Why a run was asked to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelCause {
    NotCancelled,
    Stepdown,
    Abort(String),
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::NotCancelled => write!(f, "not cancelled"),
            CancelCause::Stepdown => write!(f, "stepdown"),
            CancelCause::Abort(reason) => write!(f, "abort: {}", reason),
        }
    }
}

/// Which signals a wait should react to.
///
/// Cleanup runs under `StepdownOnly`: an abort must never interrupt the
/// unblock it is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    StepdownOnly,
    AbortOrStepdown,
}

/// Per-run view over both cancellation signals
#[derive(Debug, Clone)]
pub struct CancelState {
    stepdown: watch::Receiver<bool>,
    abort: watch::Receiver<Option<String>>,
}

impl CancelState {
    pub fn new(stepdown: StepdownToken, abort: watch::Receiver<Option<String>>) -> Self {
        Self {
            stepdown: stepdown.rx,
            abort,
        }
    }

    /// Current cause; stepdown wins over abort.
    pub fn cause(&self) -> CancelCause {
        if *self.stepdown.borrow() {
            return CancelCause::Stepdown;
        }
        match self.abort.borrow().as_ref() {
            Some(reason) => CancelCause::Abort(reason.clone()),
            None => CancelCause::NotCancelled,
        }
    }

    pub fn is_stepped_down(&self) -> bool {
        *self.stepdown.borrow()
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort.borrow().clone()
    }

    /// Cause as seen through `scope`.
    pub fn cause_in(&self, scope: CancelScope) -> CancelCause {
        match (self.cause(), scope) {
            (CancelCause::Abort(_), CancelScope::StepdownOnly) => CancelCause::NotCancelled,
            (cause, _) => cause,
        }
    }

    /// Resolves once a signal within `scope` fires. Never resolves if the
    /// senders are gone without firing.
    pub async fn cancelled(&self, scope: CancelScope) -> CancelCause {
        let mut stepdown = self.stepdown.clone();
        let mut abort = self.abort.clone();

        let stepdown_fired = async move {
            if stepdown.wait_for(|s| *s).await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        let abort_fired = async move {
            if scope == CancelScope::StepdownOnly || abort.wait_for(Option::is_some).await.is_err()
            {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = stepdown_fired => {}
            _ = abort_fired => {}
        }
        self.cause_in(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cause_priority() {
        let source = StepdownSource::new();
        let (abort_tx, abort_rx) = watch::channel(None);
        let cancel = CancelState::new(source.token(), abort_rx);
        assert_eq!(cancel.cause(), CancelCause::NotCancelled);

        abort_tx.send_replace(Some("user request".into()));
        assert_eq!(cancel.cause(), CancelCause::Abort("user request".into()));
        assert_eq!(
            cancel.cause_in(CancelScope::StepdownOnly),
            CancelCause::NotCancelled
        );

        source.step_down();
        assert_eq!(cancel.cause(), CancelCause::Stepdown);
        assert_eq!(cancel.cause_in(CancelScope::StepdownOnly), CancelCause::Stepdown);
    }

    #[tokio::test]
    async fn test_cancelled_wakes_on_stepdown() {
        let source = StepdownSource::new();
        let (_abort_tx, abort_rx) = watch::channel(None);
        let cancel = CancelState::new(source.token(), abort_rx);

        let waiter = tokio::spawn({
            let cancel = cancel.clone();
            async move { cancel.cancelled(CancelScope::AbortOrStepdown).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.step_down();
        assert_eq!(waiter.await.unwrap(), CancelCause::Stepdown);
    }

    #[tokio::test]
    async fn test_token_wait_resolves_after_fire() {
        let source = StepdownSource::new();
        let token = source.token();
        let pending = tokio::time::timeout(Duration::from_millis(20), token.stepped_down()).await;
        assert!(pending.is_err());

        source.step_down();
        token.stepped_down().await;
        assert!(token.is_stepped_down());
    }

    #[tokio::test]
    async fn test_stepdown_only_ignores_abort() {
        let source = StepdownSource::new();
        let (abort_tx, abort_rx) = watch::channel(None);
        let cancel = CancelState::new(source.token(), abort_rx);
        abort_tx.send_replace(Some("ignored".into()));

        let waited = tokio::time::timeout(
            Duration::from_millis(30),
            cancel.cancelled(CancelScope::StepdownOnly),
        )
        .await;
        assert!(waited.is_err());

        let cause = cancel.cancelled(CancelScope::AbortOrStepdown).await;
        assert_eq!(cause, CancelCause::Abort("ignored".into()));
    }
}

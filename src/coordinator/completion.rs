//! Single-assignment completion slot
//!
//! The first `resolve` wins; every future handed out before or after sees
//! the same value.

use crate::common::OperationFailure;
use crate::coordinator::document::AggregatedResponse;
use tokio::sync::watch;

pub type CompletionResult = std::result::Result<AggregatedResponse, OperationFailure>;

#[derive(Debug)]
pub struct Completion {
    tx: watch::Sender<Option<CompletionResult>>,
}

impl Completion {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Publish `result`. Returns false if a result was already published.
    pub fn resolve(&self, result: CompletionResult) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn future(&self) -> CompletionFuture {
        CompletionFuture {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the final result of one coordinator
#[derive(Debug, Clone)]
pub struct CompletionFuture {
    rx: watch::Receiver<Option<CompletionResult>>,
}

impl CompletionFuture {
    /// Result if already published.
    pub fn try_get(&self) -> Option<CompletionResult> {
        self.rx.borrow().clone()
    }

    pub async fn wait(mut self) -> CompletionResult {
        match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or_else(|| Err(dropped())),
            Err(_) => Err(dropped()),
        }
    }
}

fn dropped() -> OperationFailure {
    OperationFailure::Fatal("coordinator dropped before completion".into())
}

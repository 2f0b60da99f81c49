//! Multi-update coordinator instance
//!
//! Drives one document through
//! `Initializing → BlockingMigrations → PerformingUpdate →
//! CheckingForPendingUpdates → Unblocking → Done`.
//!
//! Each loop iteration performs the action owed by the current phase and
//! then majority-commits the next phase. The in-memory fields are replaced
//! only after that commit, so a crash at any point leaves a document whose
//! phase names the next action still to be (re)driven.
//!
//! Cancellation is checked at the top of every iteration:
//! - stepdown: stop immediately, leave the document for the next primary
//! - abort: jump to `Unblocking` carrying the abort reason

use crate::common::{DuplicateRule, Error, OperationFailure, Result, RetryPolicy};
use crate::coordinator::cancel::{CancelScope, CancelState, StepdownToken};
use crate::coordinator::completion::{Completion, CompletionFuture};
use crate::coordinator::document::{
    CoordinatorDocument, Metadata, MutableFields, Phase, SessionContext,
};
use crate::coordinator::external_state::ExternalState;
use crate::coordinator::pending::PendingUpdateTracker;
use crate::coordinator::retry::RetryUntilMajorityCommit;
use crate::coordinator::store::DocumentStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Shared collaborators handed to every instance by the service
#[derive(Clone)]
pub struct InstanceResources {
    pub store: Arc<dyn DocumentStore>,
    pub pending: Arc<PendingUpdateTracker>,
    pub retry_policy: RetryPolicy,
    pub pending_check_interval: Duration,
}

/// How a run ended on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Document reached `Done` and the completion result is published.
    Completed,
    /// Stopped at a phase boundary; the next primary resumes the document.
    SteppedDown,
}

/// Snapshot for current-op introspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentOpReport {
    #[serde(rename = "type")]
    pub op_type: String,
    pub desc: String,
    pub operation_id: Uuid,
    pub namespace: String,
    pub phase: Phase,
    pub command: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionContext>,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<OperationFailure>,
}

pub struct MultiUpdateCoordinator {
    metadata: Metadata,
    mutable: Mutex<MutableFields>,
    external_state: Box<dyn ExternalState>,
    resources: InstanceResources,
    abort_tx: watch::Sender<Option<String>>,
    completion: Completion,
    running: AtomicBool,
}

impl MultiUpdateCoordinator {
    pub fn new(
        document: CoordinatorDocument,
        external_state: Box<dyn ExternalState>,
        resources: InstanceResources,
    ) -> Self {
        let (abort_tx, _abort_rx) = watch::channel(None);
        Self {
            metadata: document.metadata,
            mutable: Mutex::new(document.mutable),
            external_state,
            resources,
            abort_tx,
            completion: Completion::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.metadata.operation_id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn phase(&self) -> Phase {
        self.mutable.lock().phase
    }

    /// Copy of the last committed document.
    pub fn document(&self) -> CoordinatorDocument {
        CoordinatorDocument {
            metadata: self.metadata.clone(),
            mutable: self.mutable.lock().clone(),
        }
    }

    pub fn completion_future(&self) -> CompletionFuture {
        self.completion.future()
    }

    /// Request an abort. The first reason sticks; later calls are ignored.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let accepted = self.abort_tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.clone());
            true
        });
        if accepted {
            tracing::info!(
                operation_id = %self.metadata.operation_id,
                reason = %reason,
                "abort requested"
            );
        }
    }

    /// Whether `candidate` is a resubmission of this operation.
    pub fn is_duplicate(&self, candidate: &Metadata, rule: DuplicateRule) -> bool {
        match rule {
            DuplicateRule::OperationId => candidate.operation_id == self.metadata.operation_id,
            DuplicateRule::Content => {
                candidate.operation_id == self.metadata.operation_id
                    || self.metadata.same_content(candidate)
            }
        }
    }

    /// Fails unless `candidate` is a duplicate of this operation.
    pub fn check_if_options_conflict(
        &self,
        candidate: &CoordinatorDocument,
        rule: DuplicateRule,
    ) -> Result<()> {
        if self.is_duplicate(&candidate.metadata, rule) {
            return Ok(());
        }
        Err(Error::ConflictingOperationInProgress {
            namespace: self.metadata.namespace.to_string(),
            existing: self.metadata.operation_id.to_string(),
        })
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_tx.borrow().clone()
    }

    pub fn report_for_current_op(&self) -> CurrentOpReport {
        let mutable = self.mutable.lock().clone();
        CurrentOpReport {
            op_type: "op".to_string(),
            desc: "MultiUpdateCoordinator".to_string(),
            operation_id: self.metadata.operation_id,
            namespace: self.metadata.namespace.to_string(),
            phase: mutable.phase,
            command: self.metadata.update_command.clone(),
            session: self.metadata.session.clone(),
            started_at: self.metadata.started_at,
            elapsed_secs: (Utc::now() - self.metadata.started_at).num_seconds(),
            abort_reason: self.abort_reason(),
            failure: mutable.failure,
        }
    }

    /// Drive the document to `Done` or until `stepdown` fires.
    ///
    /// Returns `Err` only for faults the coordinator cannot absorb (migration
    /// blocking failures, permanent store errors); the document then stays at
    /// its last committed phase for reconstruction.
    pub async fn run(&self, stepdown: StepdownToken) -> Result<RunOutcome> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal(format!(
                "coordinator {} is already running",
                self.metadata.operation_id
            )));
        }

        let cancel = CancelState::new(stepdown, self.abort_tx.subscribe());
        let retry = RetryUntilMajorityCommit::new(self.resources.retry_policy, cancel.clone());

        let result = self.drive(&cancel, &retry).await;
        match &result {
            Ok(RunOutcome::Completed) => {}
            Ok(RunOutcome::SteppedDown) => {
                self.completion.resolve(Err(OperationFailure::SteppedDown));
            }
            Err(e) => {
                tracing::error!(
                    operation_id = %self.metadata.operation_id,
                    phase = %self.phase(),
                    error = %e,
                    "coordinator failed"
                );
                self.completion
                    .resolve(Err(OperationFailure::Fatal(e.to_string())));
            }
        }
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn drive(&self, cancel: &CancelState, retry: &RetryUntilMajorityCommit) -> Result<RunOutcome> {
        tracing::info!(
            operation_id = %self.metadata.operation_id,
            namespace = %self.metadata.namespace,
            phase = %self.phase(),
            "coordinator running"
        );

        loop {
            let phase = self.phase();

            if phase.is_terminal() {
                let outcome = self.mutable.lock().outcome();
                self.completion.resolve(outcome);
                return Ok(RunOutcome::Completed);
            }

            if cancel.is_stepped_down() {
                tracing::info!(
                    operation_id = %self.metadata.operation_id,
                    phase = %phase,
                    "stepping down, leaving coordinator for the next primary"
                );
                return Ok(RunOutcome::SteppedDown);
            }

            if phase.is_abortable() {
                if let Some(reason) = cancel.abort_reason() {
                    absorb_cancel(
                        self.transition(retry, CancelScope::StepdownOnly, Phase::Unblocking, |m| {
                            m.failure = Some(OperationFailure::Aborted(reason));
                        })
                        .await,
                    )?;
                    continue;
                }
            }

            let step = match phase {
                Phase::Initializing => {
                    self.transition(retry, CancelScope::AbortOrStepdown, Phase::BlockingMigrations, |_| {})
                        .await
                }
                Phase::BlockingMigrations => self.start_blocking_migrations(retry).await,
                Phase::PerformingUpdate => self.perform_update(retry).await,
                Phase::CheckingForPendingUpdates => self.check_for_pending_updates(cancel, retry).await,
                Phase::Unblocking => self.cleanup(retry).await,
                Phase::Done => Ok(()),
            };
            absorb_cancel(step)?;
        }
    }

    async fn start_blocking_migrations(&self, retry: &RetryUntilMajorityCommit) -> Result<()> {
        self.external_state
            .start_blocking_migrations(&self.metadata)
            .await
            .map_err(|e| migration_error("block", e))?;

        self.transition(retry, CancelScope::AbortOrStepdown, Phase::PerformingUpdate, |_| {})
            .await
    }

    async fn perform_update(&self, retry: &RetryUntilMajorityCommit) -> Result<()> {
        let result = {
            let _pending = self.resources.pending.begin(&self.metadata.namespace);
            self.external_state
                .send_update_to_shards(&self.metadata)
                .await
        };

        // The outcome is recorded even if an abort arrived meanwhile.
        match result {
            Ok(response) => {
                self.transition(
                    retry,
                    CancelScope::StepdownOnly,
                    Phase::CheckingForPendingUpdates,
                    |m| m.response = Some(response),
                )
                .await
            }
            Err(e) => {
                tracing::warn!(
                    operation_id = %self.metadata.operation_id,
                    error = %e,
                    "update broadcast failed, cleaning up"
                );
                self.transition(retry, CancelScope::StepdownOnly, Phase::Unblocking, |m| {
                    m.failure = Some(OperationFailure::UpdateFailed(e.to_string()))
                })
                .await
            }
        }
    }

    async fn check_for_pending_updates(
        &self,
        cancel: &CancelState,
        retry: &RetryUntilMajorityCommit,
    ) -> Result<()> {
        let namespace = &self.metadata.namespace;
        while !self.resources.pending.is_clear(namespace) {
            tracing::debug!(
                operation_id = %self.metadata.operation_id,
                pending = self.resources.pending.pending(namespace),
                "waiting for pending updates on {}",
                namespace
            );
            tokio::select! {
                _ = tokio::time::sleep(self.resources.pending_check_interval) => {}
                cause = cancel.cancelled(CancelScope::AbortOrStepdown) => {
                    return Err(Error::Cancelled(cause.to_string()));
                }
            }
        }

        self.transition(retry, CancelScope::AbortOrStepdown, Phase::Unblocking, |_| {})
            .await
    }

    async fn cleanup(&self, retry: &RetryUntilMajorityCommit) -> Result<()> {
        self.external_state
            .stop_blocking_migrations(&self.metadata)
            .await
            .map_err(|e| migration_error("unblock", e))?;

        self.transition(retry, CancelScope::StepdownOnly, Phase::Done, |_| {})
            .await
    }

    /// Majority-commit `phase` (plus `apply`'s changes), then mirror it in memory.
    async fn transition(
        &self,
        retry: &RetryUntilMajorityCommit,
        scope: CancelScope,
        phase: Phase,
        apply: impl FnOnce(&mut MutableFields),
    ) -> Result<()> {
        let mut next = self.document();
        let from = next.mutable.phase;
        debug_assert!(phase > from, "phase regression {} -> {}", from, phase);
        next.mutable.phase = phase;
        apply(&mut next.mutable);

        let store = &self.resources.store;
        retry
            .run(scope, "coordinator document write", || store.update(&next))
            .await?;

        *self.mutable.lock() = next.mutable;
        tracing::info!(
            operation_id = %self.metadata.operation_id,
            namespace = %self.metadata.namespace,
            from = %from,
            to = %phase,
            "coordinator phase transition"
        );
        Ok(())
    }
}

/// Gateway errors already classified as migration failures pass through as is.
fn migration_error(action: &str, e: Error) -> Error {
    match e {
        Error::MigrationBlocking(_) => e,
        other => Error::MigrationBlocking(format!("failed to {} migrations: {}", action, other)),
    }
}

/// Cancellation ends a step but not the run; the loop re-checks it.
fn absorb_cancel(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) | Err(Error::Cancelled(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

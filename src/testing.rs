//! Test doubles for the coordinator
//!
//! `RecordingExternalState` records every gateway call into a shared
//! `Journal`. Attaching the same journal to an `InMemoryDocumentStore`
//! interleaves committed phases with gateway calls, so tests can check that
//! each phase is durable before its action runs.

use crate::common::{Error, Result};
use crate::coordinator::document::{AggregatedResponse, CoordinatorDocument, Metadata, Phase, ShardResponse};
use crate::coordinator::external_state::{ExternalState, ExternalStateFactory};
use crate::coordinator::store::WriteObserver;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Persist(Phase),
    StartBlocking,
    SendUpdate(serde_json::Value),
    StopBlocking,
}

/// Ordered log of persists and gateway calls
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Gateway calls only.
    pub fn actions(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| !matches!(e, Event::Persist(_)))
            .collect()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }
}

impl WriteObserver for Journal {
    fn committed(&self, doc: &CoordinatorDocument) {
        self.record(Event::Persist(doc.phase()));
    }
}

/// One-shot rendezvous that parks a gateway call until released
#[derive(Debug, Clone, Default)]
pub struct Gate {
    entered: Arc<Notify>,
    released: Arc<Notify>,
}

impl Gate {
    /// Wait until the gated call has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the gated call return.
    pub fn release(&self) {
        self.released.notify_one();
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.released.notified().await;
    }
}

#[derive(Default)]
struct Behaviour {
    response: Option<AggregatedResponse>,
    update_failure: Option<String>,
    start_failure: Option<String>,
    stop_failure: Option<String>,
    start_gate: Option<Gate>,
    update_gate: Option<Gate>,
    stop_gate: Option<Gate>,
}

/// Configurable gateway double; clones share journal and behaviour
#[derive(Clone, Default)]
pub struct RecordingExternalState {
    journal: Journal,
    behaviour: Arc<Mutex<Behaviour>>,
}

impl RecordingExternalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            behaviour: Arc::default(),
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Response returned by successful broadcasts.
    pub fn respond_with(&self, response: AggregatedResponse) {
        self.behaviour.lock().response = Some(response);
    }

    pub fn fail_update(&self, reason: impl Into<String>) {
        self.behaviour.lock().update_failure = Some(reason.into());
    }

    pub fn fail_start_blocking(&self, reason: impl Into<String>) {
        self.behaviour.lock().start_failure = Some(reason.into());
    }

    pub fn fail_stop_blocking(&self, reason: impl Into<String>) {
        self.behaviour.lock().stop_failure = Some(reason.into());
    }

    /// Let every gateway call succeed again.
    pub fn clear_failures(&self) {
        let mut behaviour = self.behaviour.lock();
        behaviour.update_failure = None;
        behaviour.start_failure = None;
        behaviour.stop_failure = None;
    }

    /// Park the next `start_blocking_migrations` call.
    pub fn hold_start_blocking(&self) -> Gate {
        let gate = Gate::default();
        self.behaviour.lock().start_gate = Some(gate.clone());
        gate
    }

    /// Park the next `send_update_to_shards` call.
    pub fn hold_update(&self) -> Gate {
        let gate = Gate::default();
        self.behaviour.lock().update_gate = Some(gate.clone());
        gate
    }

    /// Park the next `stop_blocking_migrations` call.
    pub fn hold_stop_blocking(&self) -> Gate {
        let gate = Gate::default();
        self.behaviour.lock().stop_gate = Some(gate.clone());
        gate
    }

    /// Response used when none was configured.
    pub fn default_response() -> AggregatedResponse {
        AggregatedResponse::combine(vec![
            ShardResponse {
                shard: "shard-a".into(),
                n: 2,
                n_modified: 2,
                write_errors: vec![],
            },
            ShardResponse {
                shard: "shard-b".into(),
                n: 1,
                n_modified: 1,
                write_errors: vec![],
            },
        ])
    }
}

#[async_trait]
impl ExternalState for RecordingExternalState {
    async fn send_update_to_shards(&self, metadata: &Metadata) -> Result<AggregatedResponse> {
        self.journal
            .record(Event::SendUpdate(metadata.update_command.clone()));
        let gate = self.behaviour.lock().update_gate.take();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        let behaviour = self.behaviour.lock();
        if let Some(reason) = &behaviour.update_failure {
            return Err(Error::UpdateFailed {
                shard: "shard-a".into(),
                reason: reason.clone(),
            });
        }
        Ok(behaviour
            .response
            .clone()
            .unwrap_or_else(Self::default_response))
    }

    async fn start_blocking_migrations(&self, _metadata: &Metadata) -> Result<()> {
        self.journal.record(Event::StartBlocking);
        let gate = self.behaviour.lock().start_gate.take();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        match &self.behaviour.lock().start_failure {
            Some(reason) => Err(Error::MigrationBlocking(reason.clone())),
            None => Ok(()),
        }
    }

    async fn stop_blocking_migrations(&self, _metadata: &Metadata) -> Result<()> {
        self.journal.record(Event::StopBlocking);
        let gate = self.behaviour.lock().stop_gate.take();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        match &self.behaviour.lock().stop_failure {
            Some(reason) => Err(Error::MigrationBlocking(reason.clone())),
            None => Ok(()),
        }
    }
}

impl ExternalStateFactory for RecordingExternalState {
    fn create_external_state(&self) -> Box<dyn ExternalState> {
        Box::new(self.clone())
    }
}

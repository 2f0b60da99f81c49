//! Multi-update coordinator service
//!
//! Owns the registry of live coordinators on this node:
//! - builds instances from documents (fresh or recovered)
//! - rejects a new operation whose scope overlaps a live one or an
//!   unfinished stored one, unless it is a duplicate submission, in which
//!   case that operation is returned
//! - runs instances under a concurrency limit, all sharing the current
//!   term's stepdown token
//! - rebuilds a coordinator that failed fatally from its stored document
//!   after `reconstruct_backoff_ms`, for as long as the term lasts
//!
//! `step_up` starts a primary term, waits for the previous term's instances
//! to stop and resumes every unfinished document; `step_down` fires the
//! token and waits for running instances to stop.

use crate::common::{CoordinatorConfig, Error, Result};
use crate::coordinator::cancel::{StepdownSource, StepdownToken};
use crate::coordinator::document::{CoordinatorDocument, Metadata, Phase};
use crate::coordinator::external_state::ExternalStateFactory;
use crate::coordinator::instance::{
    CurrentOpReport, InstanceResources, MultiUpdateCoordinator, RunOutcome,
};
use crate::coordinator::pending::PendingUpdateTracker;
use crate::coordinator::store::DocumentStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

pub const SERVICE_NAME: &str = "MultiUpdateCoordinatorService";

/// Collection holding coordinator documents
pub const STATE_DOCUMENTS_NS: &str = "config.multiUpdateCoordinators";

/// Result of checking a candidate against live instances
pub enum ConflictCheck {
    Accept,
    Duplicate(Arc<MultiUpdateCoordinator>),
}

/// Two operations share scope when they target the same namespace or carry
/// the same id.
fn overlaps(a: &Metadata, b: &Metadata) -> bool {
    a.operation_id == b.operation_id || a.namespace == b.namespace
}

pub struct MultiUpdateCoordinatorService {
    config: CoordinatorConfig,
    store: Arc<dyn DocumentStore>,
    factory: Box<dyn ExternalStateFactory>,
    pending: Arc<PendingUpdateTracker>,
    limiter: Arc<Semaphore>,
    instances: Mutex<HashMap<Uuid, Arc<MultiUpdateCoordinator>>>,
    live: watch::Sender<usize>,
    stepdown: Mutex<StepdownSource>,
    term: AtomicU64,
    submit_lock: tokio::sync::Mutex<()>,
}

impl MultiUpdateCoordinatorService {
    /// Create the service as a secondary; call `step_up` to start running.
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn DocumentStore>,
        factory: Box<dyn ExternalStateFactory>,
    ) -> Arc<Self> {
        let initial = StepdownSource::new();
        initial.step_down();
        let (live, _) = watch::channel(0);

        Arc::new(Self {
            limiter: Arc::new(Semaphore::new(config.max_concurrent_instances)),
            config,
            store,
            factory,
            pending: Arc::new(PendingUpdateTracker::new()),
            instances: Mutex::new(HashMap::new()),
            live,
            stepdown: Mutex::new(initial),
            term: AtomicU64::new(0),
            submit_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn service_name(&self) -> &'static str {
        SERVICE_NAME
    }

    pub fn state_documents_ns(&self) -> &'static str {
        STATE_DOCUMENTS_NS
    }

    pub fn max_concurrent_instances(&self) -> usize {
        self.config.max_concurrent_instances
    }

    pub fn is_primary(&self) -> bool {
        !self.stepdown.lock().is_stepped_down()
    }

    /// Number of primary terms started on this node.
    pub fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    /// In-flight update bookkeeping shared with every coordinator.
    ///
    /// Write paths on this node that update a namespace outside any
    /// coordinator, such as a router forwarding targeted updates, hold a
    /// guard from here for each shard round trip. A coordinator in
    /// `CheckingForPendingUpdates` keeps migrations blocked until those
    /// guards are dropped.
    pub fn pending_updates(&self) -> Arc<PendingUpdateTracker> {
        self.pending.clone()
    }

    /// Build an instance for `document` without registering or running it.
    pub fn construct_instance(&self, document: CoordinatorDocument) -> Arc<MultiUpdateCoordinator> {
        let resources = InstanceResources {
            store: self.store.clone(),
            pending: self.pending.clone(),
            retry_policy: self.config.retry_policy(),
            pending_check_interval: self.config.pending_check_interval(),
        };
        Arc::new(MultiUpdateCoordinator::new(
            document,
            self.factory.create_external_state(),
            resources,
        ))
    }

    /// Compare `candidate` with every live instance sharing its namespace or id.
    pub fn check_conflict(
        &self,
        candidate: &CoordinatorDocument,
        live: &[Arc<MultiUpdateCoordinator>],
    ) -> Result<ConflictCheck> {
        let overlapping = live
            .iter()
            .find(|instance| overlaps(instance.metadata(), &candidate.metadata));

        match overlapping {
            Some(instance) => {
                instance.check_if_options_conflict(candidate, self.config.duplicate_rule)?;
                Ok(ConflictCheck::Duplicate(instance.clone()))
            }
            None => Ok(ConflictCheck::Accept),
        }
    }

    /// Start a new operation, or return the one it duplicates.
    pub async fn get_or_create(
        self: &Arc<Self>,
        document: CoordinatorDocument,
    ) -> Result<Arc<MultiUpdateCoordinator>> {
        self.ensure_primary()?;
        let _submit = self.submit_lock.lock().await;
        self.ensure_primary()?;

        let live = self.instances();
        if let ConflictCheck::Duplicate(existing) = self.check_conflict(&document, &live)? {
            tracing::info!(
                operation_id = %existing.id(),
                namespace = %existing.metadata().namespace,
                "duplicate multi-update submission, joining live coordinator"
            );
            return Ok(existing);
        }

        // an unfinished document with no instance still owns its namespace
        if let Some(stored) = self.unfinished_overlap(&document.metadata).await? {
            let instance = self.construct_instance(stored);
            instance.check_if_options_conflict(&document, self.config.duplicate_rule)?;
            tracing::info!(
                operation_id = %instance.id(),
                namespace = %instance.metadata().namespace,
                phase = %instance.phase(),
                "duplicate multi-update submission, resuming stored coordinator"
            );
            self.launch(instance.clone());
            return Ok(instance);
        }

        self.store.insert(&document).await?;
        let instance = self.construct_instance(document);
        self.launch(instance.clone());
        Ok(instance)
    }

    /// Begin a primary term: new stepdown token, resume unfinished documents.
    pub async fn step_up(self: &Arc<Self>) -> Result<usize> {
        let _submit = self.submit_lock.lock().await;

        // instances of an earlier term must never outlive its token
        let previous = std::mem::replace(&mut *self.stepdown.lock(), StepdownSource::new());
        previous.step_down();
        let term = self.term.fetch_add(1, Ordering::SeqCst) + 1;
        self.drain().await;

        let docs = self.store.load_all().await?;
        let mut resumed = 0;
        for doc in docs {
            if doc.phase() == Phase::Done {
                continue;
            }
            tracing::info!(
                operation_id = %doc.id(),
                namespace = %doc.metadata.namespace,
                phase = %doc.phase(),
                "resuming multi-update coordinator"
            );
            self.launch(self.construct_instance(doc));
            resumed += 1;
        }

        tracing::info!(term, resumed, "{} stepped up", SERVICE_NAME);
        Ok(resumed)
    }

    /// End the primary term and wait for running instances to stop.
    pub async fn step_down(&self) {
        self.stepdown.lock().step_down();
        self.drain().await;
        tracing::info!("{} stepped down", SERVICE_NAME);
    }

    pub fn lookup(&self, id: Uuid) -> Option<Arc<MultiUpdateCoordinator>> {
        self.instances.lock().get(&id).cloned()
    }

    pub fn instances(&self) -> Vec<Arc<MultiUpdateCoordinator>> {
        self.instances.lock().values().cloned().collect()
    }

    pub fn reports(&self) -> Vec<CurrentOpReport> {
        self.instances()
            .iter()
            .map(|instance| instance.report_for_current_op())
            .collect()
    }

    pub fn abort(&self, id: Uuid, reason: impl Into<String>) -> Result<()> {
        let instance = self
            .lookup(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        instance.abort(reason);
        Ok(())
    }

    /// Stored document, for operations that are no longer live.
    pub async fn load_document(&self, id: Uuid) -> Result<Option<CoordinatorDocument>> {
        self.store.load(id).await
    }

    /// Delete the document of a finished operation.
    pub async fn forget(&self, id: Uuid) -> Result<()> {
        self.ensure_primary()?;
        let _submit = self.submit_lock.lock().await;

        match self.store.load(id).await? {
            None => Err(Error::NotFound(id.to_string())),
            Some(doc) if doc.phase() != Phase::Done => Err(Error::OperationInProgress(format!(
                "{} is at phase {}",
                id,
                doc.phase()
            ))),
            Some(_) => {
                self.store.remove(id).await?;
                tracing::info!(operation_id = %id, "removed finished coordinator document");
                Ok(())
            }
        }
    }

    fn ensure_primary(&self) -> Result<()> {
        if self.is_primary() {
            return Ok(());
        }
        Err(Error::NotPrimary(format!(
            "{} is not running on this node",
            SERVICE_NAME
        )))
    }

    async fn unfinished_overlap(&self, candidate: &Metadata) -> Result<Option<CoordinatorDocument>> {
        let docs = self.store.load_all().await?;
        Ok(docs.into_iter().find(|doc| {
            doc.phase() != Phase::Done
                && overlaps(&doc.metadata, candidate)
                && self.lookup(doc.id()).is_none()
        }))
    }

    async fn drain(&self) {
        let mut live = self.live.subscribe();
        // the sender lives in self, so this only ends when the count drains
        let _ = live.wait_for(|count| *count == 0).await;
    }

    fn register(&self, instance: &Arc<MultiUpdateCoordinator>) {
        let mut instances = self.instances.lock();
        instances.insert(instance.id(), instance.clone());
        self.live.send_replace(instances.len());
    }

    fn launch(self: &Arc<Self>, instance: Arc<MultiUpdateCoordinator>) {
        self.register(&instance);

        let token = self.stepdown.lock().token();
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut instance = instance;
            loop {
                let outcome = match service.limiter.clone().acquire_owned().await {
                    Ok(_permit) => instance.run(token.clone()).await,
                    Err(_) => Err(Error::Internal("instance limiter closed".into())),
                };

                match outcome {
                    Ok(RunOutcome::Completed) => {
                        tracing::debug!(operation_id = %instance.id(), "coordinator completed");
                    }
                    Ok(RunOutcome::SteppedDown) => {
                        tracing::debug!(operation_id = %instance.id(), "coordinator stopped for stepdown");
                    }
                    Err(e) => {
                        tracing::warn!(
                            operation_id = %instance.id(),
                            error = %e,
                            backoff_ms = service.config.reconstruct_backoff_ms,
                            "coordinator run failed, rebuilding from its stored document"
                        );
                        let rebuilt = service.reconstruct(&instance, &token).await;
                        if let Some(next) = rebuilt {
                            instance = next;
                            continue;
                        }
                    }
                }
                break;
            }
            service.deregister(&instance);
        });
    }

    /// Replace a fatally failed instance with one built from its last
    /// committed document. `None` once the term ends or the document is
    /// gone or finished. The failed instance stays registered until then,
    /// so its namespace remains claimed.
    async fn reconstruct(
        &self,
        failed: &Arc<MultiUpdateCoordinator>,
        token: &StepdownToken,
    ) -> Option<Arc<MultiUpdateCoordinator>> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconstruct_backoff()) => {}
                _ = token.stepped_down() => return None,
            }

            match self.store.load(failed.id()).await {
                Ok(Some(doc)) if doc.phase() != Phase::Done => {
                    let next = self.construct_instance(doc);
                    if let Some(reason) = failed.abort_reason() {
                        next.abort(reason);
                    }
                    self.register(&next);
                    tracing::info!(
                        operation_id = %next.id(),
                        phase = %next.phase(),
                        "rebuilt coordinator from its stored document"
                    );
                    return Some(next);
                }
                Ok(_) => return None,
                Err(e) => {
                    tracing::warn!(
                        operation_id = %failed.id(),
                        error = %e,
                        "cannot load coordinator document, retrying"
                    );
                }
            }
        }
    }

    fn deregister(&self, instance: &Arc<MultiUpdateCoordinator>) {
        let mut instances = self.instances.lock();
        if let Some(current) = instances.get(&instance.id()) {
            if Arc::ptr_eq(current, instance) {
                instances.remove(&instance.id());
            }
        }
        self.live.send_replace(instances.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DuplicateRule;
    use crate::coordinator::document::Metadata;
    use crate::coordinator::store::InMemoryDocumentStore;
    use crate::testing::RecordingExternalState;
    use serde_json::json;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            retry_initial_backoff_ms: 1,
            retry_max_backoff_ms: 2,
            pending_check_interval_ms: 5,
            ..Default::default()
        }
    }

    fn document(ns: &str, command: serde_json::Value) -> CoordinatorDocument {
        CoordinatorDocument::new(Metadata::new(ns.parse().unwrap(), command, None))
    }

    #[tokio::test]
    async fn test_rejects_submissions_when_not_primary() {
        let service = MultiUpdateCoordinatorService::new(
            config(),
            Arc::new(InMemoryDocumentStore::new()),
            Box::new(RecordingExternalState::new()),
        );
        assert!(!service.is_primary());
        assert_eq!(service.service_name(), "MultiUpdateCoordinatorService");
        assert_eq!(service.state_documents_ns(), "config.multiUpdateCoordinators");

        let result = service.get_or_create(document("db.a", json!({}))).await;
        assert!(matches!(result, Err(Error::NotPrimary(_))));
    }

    #[tokio::test]
    async fn test_conflict_check_against_live_set() {
        let service = MultiUpdateCoordinatorService::new(
            config(),
            Arc::new(InMemoryDocumentStore::new()),
            Box::new(RecordingExternalState::new()),
        );
        let existing = service.construct_instance(document("db.a", json!({"u": 1})));
        let live = vec![existing.clone()];

        let other_ns = document("db.b", json!({"u": 1}));
        assert!(matches!(
            service.check_conflict(&other_ns, &live),
            Ok(ConflictCheck::Accept)
        ));

        let same_content = document("db.a", json!({"u": 1}));
        match service.check_conflict(&same_content, &live) {
            Ok(ConflictCheck::Duplicate(found)) => assert!(Arc::ptr_eq(&found, &existing)),
            _ => panic!("expected duplicate"),
        }

        let different = document("db.a", json!({"u": 2}));
        assert!(matches!(
            service.check_conflict(&different, &live),
            Err(Error::ConflictingOperationInProgress { .. })
        ));
    }

    #[tokio::test]
    async fn test_operation_id_rule_rejects_resubmitted_content() {
        let service = MultiUpdateCoordinatorService::new(
            CoordinatorConfig {
                duplicate_rule: DuplicateRule::OperationId,
                ..config()
            },
            Arc::new(InMemoryDocumentStore::new()),
            Box::new(RecordingExternalState::new()),
        );
        let existing = service.construct_instance(document("db.a", json!({"u": 1})));
        let live = vec![existing.clone()];

        assert!(service
            .check_conflict(&document("db.a", json!({"u": 1})), &live)
            .is_err());
        assert!(matches!(
            service.check_conflict(&existing.document(), &live),
            Ok(ConflictCheck::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_step_up_skips_finished_documents() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let mut finished = document("db.done", json!({}));
        finished.mutable.phase = Phase::Done;
        store.insert(&finished).await.unwrap();

        let gateway = RecordingExternalState::new();
        let journal = gateway.journal();
        let service = MultiUpdateCoordinatorService::new(config(), store, Box::new(gateway));

        assert_eq!(service.step_up().await.unwrap(), 0);
        assert!(service.instances().is_empty());
        assert!(journal.events().is_empty());
        assert!(service.load_document(finished.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unfinished_stored_document_claims_its_namespace() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let gateway = RecordingExternalState::new();
        let journal = gateway.journal();
        let service = MultiUpdateCoordinatorService::new(config(), store.clone(), Box::new(gateway));
        service.step_up().await.unwrap();

        // left behind without an instance
        let mut orphan = document("db.a", json!({"u": 1}));
        orphan.mutable.phase = Phase::BlockingMigrations;
        store.insert(&orphan).await.unwrap();

        let different = service.get_or_create(document("db.a", json!({"u": 2}))).await;
        assert!(matches!(
            different,
            Err(Error::ConflictingOperationInProgress { .. })
        ));
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        let resubmitted = service
            .get_or_create(document("db.a", json!({"u": 1})))
            .await
            .unwrap();
        assert_eq!(resubmitted.id(), orphan.id());
        assert!(resubmitted.completion_future().wait().await.is_ok());
        assert_eq!(store.get(orphan.id()).unwrap().phase(), Phase::Done);
        assert_eq!(journal.count(&crate::testing::Event::StopBlocking), 1);
    }

    #[tokio::test]
    async fn test_forget_removes_only_finished_documents() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let mut finished = document("db.done", json!({}));
        finished.mutable.phase = Phase::Done;
        store.insert(&finished).await.unwrap();

        let gateway = RecordingExternalState::new();
        let gate = gateway.hold_start_blocking();
        let service = MultiUpdateCoordinatorService::new(config(), store.clone(), Box::new(gateway));
        assert!(matches!(
            service.forget(finished.id()).await,
            Err(Error::NotPrimary(_))
        ));
        service.step_up().await.unwrap();

        let running = service
            .get_or_create(document("db.running", json!({})))
            .await
            .unwrap();
        gate.entered().await;
        assert!(matches!(
            service.forget(running.id()).await,
            Err(Error::OperationInProgress(_))
        ));

        service.forget(finished.id()).await.unwrap();
        assert!(store.get(finished.id()).is_none());
        assert!(matches!(
            service.forget(finished.id()).await,
            Err(Error::NotFound(_))
        ));

        gate.release();
        assert!(running.completion_future().wait().await.is_ok());
        assert!(store.get(running.id()).is_some());
    }
}

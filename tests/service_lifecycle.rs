//! Service-level tests: duplicate detection, step up / step down, recovery

use multiupdate::common::{CoordinatorConfig, Error, OperationFailure};
use multiupdate::coordinator::document::{CoordinatorDocument, Metadata, Namespace, Phase};
use multiupdate::coordinator::service::MultiUpdateCoordinatorService;
use multiupdate::coordinator::store::{DocumentStore, InMemoryDocumentStore, RocksDocumentStore};
use multiupdate::testing::{Event, RecordingExternalState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        retry_initial_backoff_ms: 1,
        retry_max_backoff_ms: 4,
        pending_check_interval_ms: 5,
        reconstruct_backoff_ms: 5,
        ..Default::default()
    }
}

fn document(ns: &str, command: Value) -> CoordinatorDocument {
    CoordinatorDocument::new(Metadata::new(ns.parse().unwrap(), command, None))
}

async fn primary(
    store: Arc<dyn DocumentStore>,
    gateway: &RecordingExternalState,
) -> Arc<MultiUpdateCoordinatorService> {
    let service = MultiUpdateCoordinatorService::new(config(), store, Box::new(gateway.clone()));
    service.step_up().await.unwrap();
    service
}

#[tokio::test]
async fn test_identical_submission_joins_live_instance() {
    let gateway = RecordingExternalState::new();
    let gate = gateway.hold_start_blocking();
    let service = primary(Arc::new(InMemoryDocumentStore::new()), &gateway).await;

    let command = json!({"u": {"$inc": {"views": 1}}, "multi": true});
    let first = service
        .get_or_create(document("blog.posts", command.clone()))
        .await
        .unwrap();
    gate.entered().await;

    let second = service
        .get_or_create(document("blog.posts", command))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(service.instances().len(), 1);

    let conflicting = service
        .get_or_create(document("blog.posts", json!({"u": {"$set": {"hidden": true}}})))
        .await;
    assert!(matches!(
        conflicting,
        Err(Error::ConflictingOperationInProgress { .. })
    ));

    // other namespaces are independent
    let other = service
        .get_or_create(document("blog.comments", json!({"u": {}})))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &other));

    gate.release();
    let (a, b) = tokio::join!(
        first.completion_future().wait(),
        second.completion_future().wait()
    );
    assert!(a.is_ok());
    assert_eq!(a, b);
    assert!(other.completion_future().wait().await.is_ok());

    let journal = gateway.journal();
    assert_eq!(journal.count(&Event::StartBlocking), 2);
    assert_eq!(journal.count(&Event::StopBlocking), 2);
}

#[tokio::test]
async fn test_step_down_then_step_up_resumes_document() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let gateway = RecordingExternalState::new();
    let gate = gateway.hold_start_blocking();
    let service = primary(store.clone(), &gateway).await;

    let instance = service
        .get_or_create(document("shop.orders", json!({"u": {"$set": {"x": 1}}})))
        .await
        .unwrap();
    let id = instance.id();
    gate.entered().await;

    let stepping_down = tokio::spawn({
        let service = service.clone();
        async move { service.step_down().await }
    });
    while service.is_primary() {
        tokio::task::yield_now().await;
    }
    gate.release();
    stepping_down.await.unwrap();

    assert_eq!(
        instance.completion_future().wait().await,
        Err(OperationFailure::SteppedDown)
    );
    assert!(service.instances().is_empty());
    assert_eq!(store.get(id).unwrap().phase(), Phase::BlockingMigrations);
    assert!(matches!(
        service.get_or_create(document("shop.other", json!({}))).await,
        Err(Error::NotPrimary(_))
    ));

    let gate = gateway.hold_start_blocking();
    assert_eq!(service.step_up().await.unwrap(), 1);
    gate.entered().await;
    let resumed = service.lookup(id).expect("resumed instance");
    assert!(!Arc::ptr_eq(&resumed, &instance));
    assert_eq!(resumed.phase(), Phase::BlockingMigrations);
    gate.release();
    assert!(resumed.completion_future().wait().await.is_ok());

    let journal = gateway.journal();
    assert_eq!(journal.count(&Event::StartBlocking), 2);
    assert_eq!(journal.count(&Event::StopBlocking), 1);
    assert_eq!(store.get(id).unwrap().phase(), Phase::Done);
}

async fn wait_until_idle(service: &MultiUpdateCoordinatorService) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !service.instances().is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("coordinators still registered");
}

#[tokio::test]
async fn test_step_up_while_primary_hands_running_documents_to_new_term() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let gateway = RecordingExternalState::new();
    let first_gate = gateway.hold_start_blocking();
    let service = primary(store.clone(), &gateway).await;
    assert_eq!(service.term(), 1);

    let instance = service
        .get_or_create(document("shop.orders", json!({"u": {"$set": {"x": 1}}})))
        .await
        .unwrap();
    let id = instance.id();
    first_gate.entered().await;

    let stepping_up = tokio::spawn({
        let service = service.clone();
        async move { service.step_up().await }
    });
    // the old term's token has fired once the new term is counted
    while service.term() < 2 {
        tokio::task::yield_now().await;
    }
    let second_gate = gateway.hold_start_blocking();
    first_gate.release();

    assert_eq!(stepping_up.await.unwrap().unwrap(), 1);
    assert_eq!(
        instance.completion_future().wait().await,
        Err(OperationFailure::SteppedDown)
    );
    assert!(service.is_primary());

    second_gate.entered().await;
    let resumed = service.lookup(id).expect("resumed instance");
    assert!(!Arc::ptr_eq(&resumed, &instance));
    second_gate.release();
    assert!(resumed.completion_future().wait().await.is_ok());

    let journal = gateway.journal();
    assert_eq!(journal.count(&Event::StartBlocking), 2);
    assert_eq!(journal.count(&Event::StopBlocking), 1);
    assert_eq!(store.get(id).unwrap().phase(), Phase::Done);
}

#[tokio::test]
async fn test_fatal_coordinator_keeps_namespace_until_rebuilt() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let gateway = RecordingExternalState::new();
    gateway.fail_start_blocking("config server rejected block");
    let service = primary(store.clone(), &gateway).await;

    let failed = service
        .get_or_create(document("db.c", json!({"u": {"$set": {"a": 1}}})))
        .await
        .unwrap();
    let id = failed.id();
    assert!(matches!(
        failed.completion_future().wait().await,
        Err(OperationFailure::Fatal(_))
    ));

    // the unfinished operation still owns db.c
    let conflicting = service
        .get_or_create(document("db.c", json!({"u": {"$set": {"a": 2}}})))
        .await;
    assert!(matches!(
        conflicting,
        Err(Error::ConflictingOperationInProgress { .. })
    ));
    assert_eq!(store.load_all().await.unwrap().len(), 1);
    assert!(service.lookup(id).is_some());

    // rebuilt from the stored document within the same term
    gateway.clear_failures();
    wait_until_idle(&service).await;
    let finished = store.get(id).unwrap();
    assert_eq!(finished.phase(), Phase::Done);
    assert_eq!(
        finished.mutable.response,
        Some(RecordingExternalState::default_response())
    );

    let journal = gateway.journal();
    assert!(journal.count(&Event::StartBlocking) >= 2);
    assert_eq!(journal.count(&Event::StopBlocking), 1);

    let next = service
        .get_or_create(document("db.c", json!({"u": {"$set": {"a": 2}}})))
        .await
        .unwrap();
    assert!(next.completion_future().wait().await.is_ok());
}

#[tokio::test]
async fn test_outside_update_holds_back_unblocking() {
    let gateway = RecordingExternalState::new();
    let service = primary(Arc::new(InMemoryDocumentStore::new()), &gateway).await;

    let namespace: Namespace = "shop.orders".parse().unwrap();
    let routed_update = service.pending_updates().begin(&namespace);

    let instance = service
        .get_or_create(document("shop.orders", json!({"u": {"$set": {"z": 3}}})))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while instance.phase() != Phase::CheckingForPendingUpdates {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(instance.phase(), Phase::CheckingForPendingUpdates);
    assert_eq!(gateway.journal().count(&Event::StopBlocking), 0);

    drop(routed_update);
    assert!(instance.completion_future().wait().await.is_ok());
    assert_eq!(gateway.journal().count(&Event::StopBlocking), 1);
}

#[tokio::test]
async fn test_abort_through_service() {
    let gateway = RecordingExternalState::new();
    let gate = gateway.hold_start_blocking();
    let service = primary(Arc::new(InMemoryDocumentStore::new()), &gateway).await;

    let instance = service
        .get_or_create(document("shop.orders", json!({})))
        .await
        .unwrap();
    gate.entered().await;

    service.abort(instance.id(), "operator request").unwrap();
    assert_eq!(
        service.reports()[0].abort_reason.as_deref(),
        Some("operator request")
    );
    gate.release();

    assert_eq!(
        instance.completion_future().wait().await,
        Err(OperationFailure::Aborted("operator request".into()))
    );
    assert_eq!(gateway.journal().count(&Event::StopBlocking), 1);
    assert!(gateway
        .journal()
        .actions()
        .iter()
        .all(|e| !matches!(e, Event::SendUpdate(_))));

    assert!(matches!(
        service.abort(uuid::Uuid::new_v4(), "nothing"),
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_rocksdb_document_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("coord-data");

    // crashed after committing PerformingUpdate
    let mut doc = document("shop.orders", json!({"u": {"$set": {"y": 2}}}));
    {
        let store = RocksDocumentStore::open(&path).unwrap();
        store.insert(&doc).await.unwrap();
        doc.mutable.phase = Phase::PerformingUpdate;
        store.update(&doc).await.unwrap();
    }

    let gateway = RecordingExternalState::new();
    let gate = gateway.hold_update();
    let store = Arc::new(RocksDocumentStore::open(&path).unwrap());
    let service = primary(store, &gateway).await;

    gate.entered().await;
    let instance = service.lookup(doc.id()).expect("resumed instance");
    gate.release();
    assert_eq!(
        instance.completion_future().wait().await,
        Ok(RecordingExternalState::default_response())
    );
    assert_eq!(
        gateway.journal().actions(),
        vec![
            Event::SendUpdate(json!({"u": {"$set": {"y": 2}}})),
            Event::StopBlocking,
        ]
    );

    let stored = service.load_document(doc.id()).await.unwrap().unwrap();
    assert_eq!(stored.phase(), Phase::Done);
    assert_eq!(stored.mutable.response, Some(RecordingExternalState::default_response()));

    // finished documents are kept but not resumed
    service.step_down().await;
    assert_eq!(service.step_up().await.unwrap(), 0);
}

//! Coordinator document store
//!
//! Stores one record per multi-update, keyed by operation id:
//! - `RocksDocumentStore`: RocksDB column family, synced writes
//! - `InMemoryDocumentStore`: tests, with injectable write-concern failures
//!
//! `update` returns only once the write is majority-committed. A transient
//! replication failure surfaces as a retryable error (see `Error::is_retryable`).

use crate::common::{Error, Result};
use crate::coordinator::document::{CoordinatorDocument, Phase};
use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{Options, WriteOptions, DB};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Column family holding `config.multiUpdateCoordinators`
const CF_COORDINATORS: &str = "multi_update_coordinators";

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a fresh document. Fails if the id already exists.
    async fn insert(&self, doc: &CoordinatorDocument) -> Result<()>;

    /// Replace an existing document, majority-committed on return.
    async fn update(&self, doc: &CoordinatorDocument) -> Result<()>;

    async fn remove(&self, id: Uuid) -> Result<()>;

    async fn load(&self, id: Uuid) -> Result<Option<CoordinatorDocument>>;

    async fn load_all(&self) -> Result<Vec<CoordinatorDocument>>;
}

/// RocksDB-backed store
pub struct RocksDocumentStore {
    db: DB,
}

impl RocksDocumentStore {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_COORDINATORS])?;

        Ok(Self { db })
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(CF_COORDINATORS)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", CF_COORDINATORS)))
    }

    fn put(&self, doc: &CoordinatorDocument) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .put_cf_opt(self.cf()?, doc.id().as_bytes(), doc.to_bytes()?, &write_opts)?;
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<CoordinatorDocument>> {
        match self.db.get_cf(self.cf()?, id.as_bytes())? {
            Some(bytes) => Ok(Some(CoordinatorDocument::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for RocksDocumentStore {
    async fn insert(&self, doc: &CoordinatorDocument) -> Result<()> {
        if self.get(doc.id())?.is_some() {
            return Err(Error::DuplicateDocument(doc.id().to_string()));
        }
        self.put(doc)
    }

    async fn update(&self, doc: &CoordinatorDocument) -> Result<()> {
        if self.get(doc.id())?.is_none() {
            return Err(Error::NotFound(doc.id().to_string()));
        }
        self.put(doc)
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.db.delete_cf(self.cf()?, id.as_bytes())?;
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<CoordinatorDocument>> {
        self.get(id)
    }

    async fn load_all(&self) -> Result<Vec<CoordinatorDocument>> {
        let iter = self.db.iterator_cf(self.cf()?, rocksdb::IteratorMode::Start);

        let mut docs = Vec::new();
        for item in iter {
            let (_, value_bytes) = item?;
            docs.push(CoordinatorDocument::from_bytes(&value_bytes)?);
        }

        Ok(docs)
    }
}

/// Observer notified after every committed write, used by tests to
/// interleave persistence with gateway calls in one journal.
pub trait WriteObserver: Send + Sync {
    fn committed(&self, doc: &CoordinatorDocument);
}

/// In-memory store for tests
#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: Mutex<BTreeMap<Uuid, CoordinatorDocument>>,
    injected_failures: Mutex<VecDeque<Error>>,
    writes: Mutex<Vec<(Uuid, Phase)>>,
    observer: Mutex<Option<Arc<dyn WriteObserver>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_observer(&self, observer: Arc<dyn WriteObserver>) {
        *self.observer.lock() = Some(observer);
    }

    /// Make the next `update` calls fail with `error`, in order.
    pub fn fail_next_update(&self, error: Error) {
        self.injected_failures.lock().push_back(error);
    }

    /// Phases written by committed `update` calls, in commit order.
    pub fn committed_phases(&self, id: Uuid) -> Vec<Phase> {
        self.writes
            .lock()
            .iter()
            .filter(|(doc_id, _)| *doc_id == id)
            .map(|(_, phase)| *phase)
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<CoordinatorDocument> {
        self.docs.lock().get(&id).cloned()
    }

    fn notify(&self, doc: &CoordinatorDocument) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.committed(doc);
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert(&self, doc: &CoordinatorDocument) -> Result<()> {
        {
            let mut docs = self.docs.lock();
            if docs.contains_key(&doc.id()) {
                return Err(Error::DuplicateDocument(doc.id().to_string()));
            }
            docs.insert(doc.id(), doc.clone());
        }
        Ok(())
    }

    async fn update(&self, doc: &CoordinatorDocument) -> Result<()> {
        if let Some(error) = self.injected_failures.lock().pop_front() {
            return Err(error);
        }
        {
            let mut docs = self.docs.lock();
            if !docs.contains_key(&doc.id()) {
                return Err(Error::NotFound(doc.id().to_string()));
            }
            docs.insert(doc.id(), doc.clone());
        }
        self.writes.lock().push((doc.id(), doc.phase()));
        self.notify(doc);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.docs.lock().remove(&id);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<CoordinatorDocument>> {
        Ok(self.get(id))
    }

    async fn load_all(&self) -> Result<Vec<CoordinatorDocument>> {
        Ok(self.docs.lock().values().cloned().collect())
    }
}

//! Multi-update coordination
//!
//! A multi-update is broadcast to every shard while chunk migrations for the
//! namespace are blocked. Progress is recorded in a coordinator document so a
//! new primary can pick the operation up where the previous one left off.
//!
//! - `document`: persisted state and phase ordering
//! - `instance`: the per-operation state machine
//! - `service`: registry, conflict detection, step up / step down
//! - `store`: durable document storage (RocksDB, in-memory)
//! - `external_state`: shard and migration control gateway
//! - `http` / `server`: the public API

pub mod cancel;
pub mod completion;
pub mod document;
pub mod external_state;
pub mod http;
pub mod instance;
pub mod pending;
pub mod retry;
pub mod server;
pub mod service;
pub mod store;

pub use completion::{CompletionFuture, CompletionResult};
pub use document::{
    AggregatedResponse, CoordinatorDocument, Metadata, MutableFields, Namespace, Phase,
    SessionContext, ShardResponse,
};
pub use external_state::{ExternalState, ExternalStateFactory, HttpExternalStateFactory};
pub use instance::{CurrentOpReport, MultiUpdateCoordinator, RunOutcome};
pub use server::Coordinator;
pub use service::{MultiUpdateCoordinatorService, SERVICE_NAME, STATE_DOCUMENTS_NS};
pub use store::{DocumentStore, InMemoryDocumentStore, RocksDocumentStore};

//! # multiupdate
//!
//! Durable coordination of multi-document updates across a sharded cluster:
//! - migrations for the target namespace are blocked while the update runs
//! - every phase is majority-committed before its action, so a new primary
//!   resumes an interrupted operation instead of starting over
//! - duplicate submissions join the live operation; overlapping ones are rejected
//! - abort and stepdown both leave the cluster unblocked or resumable
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │      MultiUpdateCoordinatorService         │
//! │  registry · conflict check · step up/down  │
//! └───────────┬────────────────────────────────┘
//!             │ one instance per operation
//! ┌───────────▼────────────────────────────────┐
//! │        MultiUpdateCoordinator              │
//! │ Initializing → BlockingMigrations →        │
//! │ PerformingUpdate → CheckingForPending →    │
//! │ Unblocking → Done                          │
//! └──────┬─────────────────────────┬───────────┘
//!        │ DocumentStore           │ ExternalState
//! ┌──────▼───────┐     ┌───────────▼──────────┐
//! │   RocksDB    │     │ shards · config srv  │
//! └──────────────┘     └──────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! multiupdate-coord serve \
//!   --id coord-1 \
//!   --bind 0.0.0.0:7000 \
//!   --db ./coord-data \
//!   --shards http://shard-a:8000,http://shard-b:8000 \
//!   --config-server http://config:7100
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Run an update and wait for the combined reply
//! multiupdate submit shop.orders '{"q": {}, "u": {"$set": {"archived": true}}, "multi": true}'
//!
//! # Inspect and abort
//! multiupdate current-op
//! multiupdate status <operation-id>
//! multiupdate abort <operation-id> --reason "maintenance window"
//!
//! # Drop a finished operation's document
//! multiupdate forget <operation-id>
//! ```

pub mod common;
pub mod coordinator;
pub mod testing;

// Re-export commonly used types
pub use common::{Config, Error, OperationFailure, Result};
pub use coordinator::{Coordinator, MultiUpdateCoordinator, MultiUpdateCoordinatorService};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");

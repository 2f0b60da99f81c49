//! Persisted coordinator document
//!
//! A document is the unit of durability for one multi-update:
//! - Metadata: identity, namespace, command and session (immutable)
//! - Mutable fields: current phase plus phase-scoped results
//!
//! The in-memory copy held by a running coordinator is only ever replaced
//! by a document that has already been majority-committed.

use crate::common::{Error, OperationFailure, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Database and collection targeted by an update (`db.collection`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Result<Self> {
        let db = db.into();
        let coll = coll.into();
        if db.is_empty() || coll.is_empty() {
            return Err(Error::InvalidNamespace(format!("{}.{}", db, coll)));
        }
        if db.contains('.') || db.contains(char::is_whitespace) {
            return Err(Error::InvalidNamespace(format!(
                "database name '{}' must not contain '.' or whitespace",
                db
            )));
        }
        Ok(Self { db, coll })
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }
}

impl std::str::FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) => Namespace::new(db, coll),
            None => Err(Error::InvalidNamespace(s.to_string())),
        }
    }
}

impl TryFrom<String> for Namespace {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Logical session the update runs under, so shards can suppress a
/// re-issued command after failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub lsid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_number: Option<u64>,
}

/// Immutable identity of one multi-update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub operation_id: Uuid,
    pub namespace: Namespace,
    pub update_command: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionContext>,
    pub started_at: DateTime<Utc>,
}

impl Metadata {
    pub fn new(
        namespace: Namespace,
        update_command: serde_json::Value,
        session: Option<SessionContext>,
    ) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            namespace,
            update_command,
            session,
            started_at: Utc::now(),
        }
    }

    /// Same namespace, command and session; ignores id and start time.
    pub fn same_content(&self, other: &Metadata) -> bool {
        self.namespace == other.namespace
            && self.update_command == other.update_command
            && self.session == other.session
    }
}

/// Coordinator phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    BlockingMigrations,
    PerformingUpdate,
    CheckingForPendingUpdates,
    Unblocking,
    Done,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done)
    }

    /// Phases whose forward work an abort may cut short.
    pub fn is_abortable(&self) -> bool {
        *self < Phase::Unblocking
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Initializing => "initializing",
            Phase::BlockingMigrations => "blocking_migrations",
            Phase::PerformingUpdate => "performing_update",
            Phase::CheckingForPendingUpdates => "checking_for_pending_updates",
            Phase::Unblocking => "unblocking",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Reply of a single shard to the update broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShardResponse {
    #[serde(default)]
    pub shard: String,
    pub n: u64,
    pub n_modified: u64,
    #[serde(default)]
    pub write_errors: Vec<String>,
}

/// Combined reply of all shards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AggregatedResponse {
    pub n: u64,
    pub n_modified: u64,
    pub shards: Vec<ShardResponse>,
}

impl AggregatedResponse {
    pub fn combine(responses: impl IntoIterator<Item = ShardResponse>) -> Self {
        let mut aggregated = AggregatedResponse::default();
        for response in responses {
            aggregated.n += response.n;
            aggregated.n_modified += response.n_modified;
            aggregated.shards.push(response);
        }
        aggregated
    }

    pub fn write_errors(&self) -> impl Iterator<Item = (&str, &str)> {
        self.shards.iter().flat_map(|s| {
            s.write_errors
                .iter()
                .map(move |e| (s.shard.as_str(), e.as_str()))
        })
    }
}

/// Replicated machine state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutableFields {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AggregatedResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<OperationFailure>,
}

impl Default for MutableFields {
    fn default() -> Self {
        Self {
            phase: Phase::Initializing,
            response: None,
            failure: None,
        }
    }
}

impl MutableFields {
    /// Terminal result carried by the fields; a failure wins over a response.
    pub fn outcome(&self) -> std::result::Result<AggregatedResponse, OperationFailure> {
        match (&self.failure, &self.response) {
            (Some(failure), _) => Err(failure.clone()),
            (None, Some(response)) => Ok(response.clone()),
            (None, None) => Err(OperationFailure::Fatal(
                "coordinator finished without a recorded response".into(),
            )),
        }
    }
}

/// Metadata + mutable fields, serialized as one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorDocument {
    pub metadata: Metadata,
    #[serde(default)]
    pub mutable: MutableFields,
}

impl CoordinatorDocument {
    /// Fresh document in `Initializing`.
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            mutable: MutableFields::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.metadata.operation_id
    }

    pub fn phase(&self) -> Phase {
        self.mutable.phase
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Corrupted(e.to_string()))
    }
}

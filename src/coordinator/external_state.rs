//! Gateway to the shards and to the migration control plane
//!
//! The coordinator only needs three things from the cluster:
//! - broadcast the update to every shard and get one combined reply
//! - engage migration blocking for the namespace
//! - release it again
//!
//! `HttpExternalState` talks to real endpoints; tests supply their own
//! implementation through `ExternalStateFactory`.

use crate::common::{CoordinatorConfig, Error, Result};
use crate::coordinator::document::{
    AggregatedResponse, Metadata, Namespace, SessionContext, ShardResponse,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use uuid::Uuid;

#[async_trait]
pub trait ExternalState: Send + Sync {
    /// Fan the update out to all shards. Re-sending for the same operation
    /// must be safe; duplicate suppression happens on the shard side.
    async fn send_update_to_shards(&self, metadata: &Metadata) -> Result<AggregatedResponse>;

    async fn start_blocking_migrations(&self, metadata: &Metadata) -> Result<()>;

    async fn stop_blocking_migrations(&self, metadata: &Metadata) -> Result<()>;
}

pub trait ExternalStateFactory: Send + Sync {
    fn create_external_state(&self) -> Box<dyn ExternalState>;
}

#[derive(Serialize)]
struct ShardUpdateRequest<'a> {
    operation_id: Uuid,
    namespace: &'a Namespace,
    command: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a SessionContext>,
}

#[derive(Serialize)]
struct MigrationBlockRequest<'a> {
    operation_id: Uuid,
    namespace: &'a Namespace,
}

/// HTTP-backed gateway
pub struct HttpExternalState {
    client: reqwest::Client,
    shards: Vec<String>,
    config_server: String,
}

impl HttpExternalState {
    pub fn new(client: reqwest::Client, shards: Vec<String>, config_server: String) -> Self {
        Self {
            client,
            shards,
            config_server,
        }
    }

    async fn send_to_shard(&self, shard: &str, request: &ShardUpdateRequest<'_>) -> Result<ShardResponse> {
        let url = format!("{}/internal/multi-update", shard.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::UpdateFailed {
                shard: shard.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::UpdateFailed {
                shard: shard.to_string(),
                reason: format!("HTTP {}: {}", status, body),
            });
        }

        let mut reply: ShardResponse = resp.json().await.map_err(|e| Error::UpdateFailed {
            shard: shard.to_string(),
            reason: format!("invalid reply: {}", e),
        })?;
        reply.shard = shard.to_string();
        Ok(reply)
    }

    async fn migration_control(&self, action: &str, metadata: &Metadata) -> Result<()> {
        let url = format!(
            "{}/internal/migrations/{}",
            self.config_server.trim_end_matches('/'),
            action
        );
        let request = MigrationBlockRequest {
            operation_id: metadata.operation_id,
            namespace: &metadata.namespace,
        };

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::MigrationBlocking(format!("{} {}: {}", action, url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::MigrationBlocking(format!(
                "{} {}: HTTP {}: {}",
                action, metadata.namespace, status, body
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ExternalState for HttpExternalState {
    async fn send_update_to_shards(&self, metadata: &Metadata) -> Result<AggregatedResponse> {
        if self.shards.is_empty() {
            return Err(Error::InvalidConfig("no shards configured".into()));
        }

        let request = ShardUpdateRequest {
            operation_id: metadata.operation_id,
            namespace: &metadata.namespace,
            command: &metadata.update_command,
            session: metadata.session.as_ref(),
        };

        let replies = join_all(
            self.shards
                .iter()
                .map(|shard| self.send_to_shard(shard, &request)),
        )
        .await;

        let replies = replies.into_iter().collect::<Result<Vec<_>>>()?;
        let aggregated = AggregatedResponse::combine(replies);

        if let Some((shard, reason)) = aggregated.write_errors().next() {
            return Err(Error::UpdateFailed {
                shard: shard.to_string(),
                reason: reason.to_string(),
            });
        }

        tracing::debug!(
            operation_id = %metadata.operation_id,
            n = aggregated.n,
            n_modified = aggregated.n_modified,
            "update broadcast complete"
        );
        Ok(aggregated)
    }

    async fn start_blocking_migrations(&self, metadata: &Metadata) -> Result<()> {
        self.migration_control("block", metadata).await
    }

    async fn stop_blocking_migrations(&self, metadata: &Metadata) -> Result<()> {
        self.migration_control("unblock", metadata).await
    }
}

/// Builds `HttpExternalState` instances sharing one connection pool
pub struct HttpExternalStateFactory {
    client: reqwest::Client,
    shards: Vec<String>,
    config_server: String,
}

impl HttpExternalStateFactory {
    pub fn new(config: &CoordinatorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            shards: config.shards.clone(),
            config_server: config.config_server.clone(),
        })
    }
}

impl ExternalStateFactory for HttpExternalStateFactory {
    fn create_external_state(&self) -> Box<dyn ExternalState> {
        Box::new(HttpExternalState::new(
            self.client.clone(),
            self.shards.clone(),
            self.config_server.clone(),
        ))
    }
}

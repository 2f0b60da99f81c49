//! Coordinator server

use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::external_state::HttpExternalStateFactory;
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::service::MultiUpdateCoordinatorService;
use crate::coordinator::store::RocksDocumentStore;
use std::sync::Arc;

pub struct Coordinator {
    config: CoordinatorConfig,
    node_id: String,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, node_id: String) -> Self {
        Self { config, node_id }
    }

    /// Open the store, resume unfinished coordinators and serve the HTTP API
    /// until ctrl-c. Running coordinators are stepped down before returning.
    pub async fn serve(self) -> Result<()> {
        self.config.validate()?;

        tracing::info!("Starting multi-update coordinator: {}", self.node_id);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  DB path: {}", self.config.db_path.display());
        tracing::info!("  Shards: {}", self.config.shards.join(", "));
        tracing::info!("  Config server: {}", self.config.config_server);

        let store = Arc::new(RocksDocumentStore::open(&self.config.db_path)?);
        let factory = HttpExternalStateFactory::new(&self.config)?;
        let service =
            MultiUpdateCoordinatorService::new(self.config.clone(), store, Box::new(factory));

        let resumed = service.step_up().await?;

        let router = create_router(CoordState {
            service: service.clone(),
        });
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        tracing::info!("✓ Coordinator ready ({} resumed)", resumed);

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        if let Err(e) = &served {
            tracing::error!("HTTP server error: {}", e);
        }

        service.step_down().await;
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

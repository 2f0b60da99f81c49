//! HTTP API for the coordinator
//!
//! - `POST /multi-update`: start (or join) a multi-update
//! - `GET /multi-update/:id`: current-op report, or the stored document
//! - `GET /multi-update/:id/result`: wait for the final result
//! - `POST /multi-update/:id/abort`: request an abort
//! - `DELETE /multi-update/:id`: drop the document of a finished operation
//! - `GET /current-op`: reports for every live coordinator
//! - `GET /health`

use crate::common::{Error, OperationFailure};
use crate::coordinator::completion::CompletionResult;
use crate::coordinator::document::{CoordinatorDocument, Metadata, Namespace, Phase, SessionContext};
use crate::coordinator::service::MultiUpdateCoordinatorService;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct CoordState {
    pub service: Arc<MultiUpdateCoordinatorService>,
}

/// Request body for starting a multi-update
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// Target namespace (`db.collection`)
    pub namespace: String,
    /// Update command broadcast to the shards
    pub command: Value,
    #[serde(default)]
    pub session: Option<SessionContext>,
    /// Wait for the final result before replying
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
struct AbortRequest {
    #[serde(default)]
    reason: Option<String>,
}

pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/multi-update", post(submit))
        .route("/multi-update/:id", get(status).delete(forget))
        .route("/multi-update/:id/result", get(result))
        .route("/multi-update/:id/abort", post(abort))
        .route("/current-op", get(current_op))
        .route("/health", get(health))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(e: Error) -> Response {
    (e.to_http_status(), Json(json!({ "ok": 0, "error": e.to_string() }))).into_response()
}

fn completion_response(id: Uuid, result: CompletionResult) -> Response {
    match result {
        Ok(response) => (
            StatusCode::OK,
            Json(json!({ "ok": 1, "operation_id": id, "response": response })),
        )
            .into_response(),
        Err(failure) => {
            let status = match &failure {
                OperationFailure::UpdateFailed(_) => StatusCode::BAD_GATEWAY,
                OperationFailure::Aborted(_) => StatusCode::CONFLICT,
                OperationFailure::SteppedDown => StatusCode::SERVICE_UNAVAILABLE,
                OperationFailure::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(json!({
                    "ok": 0,
                    "operation_id": id,
                    "failure": failure,
                    "error": failure.to_string(),
                })),
            )
                .into_response()
        }
    }
}

fn parse_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": 0, "error": format!("invalid operation id: {}", id) })),
        )
            .into_response()
    })
}

async fn submit(State(state): State<CoordState>, Json(req): Json<SubmitRequest>) -> Response {
    let namespace: Namespace = match req.namespace.parse() {
        Ok(ns) => ns,
        Err(e) => return error_response(e),
    };
    let document = CoordinatorDocument::new(Metadata::new(namespace, req.command, req.session));

    let instance = match state.service.get_or_create(document).await {
        Ok(instance) => instance,
        Err(e) => return error_response(e),
    };

    if !req.wait {
        return (
            StatusCode::ACCEPTED,
            Json(json!({ "ok": 1, "operation_id": instance.id(), "phase": instance.phase() })),
        )
            .into_response();
    }

    let result = instance.completion_future().wait().await;
    completion_response(instance.id(), result)
}

async fn status(State(state): State<CoordState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    if let Some(instance) = state.service.lookup(id) {
        return Json(instance.report_for_current_op()).into_response();
    }

    match state.service.load_document(id).await {
        Ok(Some(doc)) => Json(json!({
            "operation_id": doc.id(),
            "namespace": doc.metadata.namespace,
            "phase": doc.phase(),
            "response": doc.mutable.response,
            "failure": doc.mutable.failure,
            "live": false,
        }))
        .into_response(),
        Ok(None) => error_response(Error::NotFound(id.to_string())),
        Err(e) => error_response(e),
    }
}

async fn result(State(state): State<CoordState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    if let Some(instance) = state.service.lookup(id) {
        let result = instance.completion_future().wait().await;
        return completion_response(id, result);
    }

    match state.service.load_document(id).await {
        Ok(Some(doc)) if doc.phase() == Phase::Done => completion_response(id, doc.mutable.outcome()),
        Ok(Some(doc)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "ok": 0,
                "operation_id": id,
                "phase": doc.phase(),
                "error": "coordinator is not running on this node",
            })),
        )
            .into_response(),
        Ok(None) => error_response(Error::NotFound(id.to_string())),
        Err(e) => error_response(e),
    }
}

async fn abort(
    State(state): State<CoordState>,
    Path(id): Path<String>,
    body: Option<Json<AbortRequest>>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "aborted by user request".to_string());

    match state.service.abort(id, reason) {
        Ok(()) => Json(json!({ "ok": 1, "operation_id": id })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn forget(State(state): State<CoordState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.service.forget(id).await {
        Ok(()) => Json(json!({ "ok": 1, "operation_id": id })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn current_op(State(state): State<CoordState>) -> impl IntoResponse {
    Json(json!({ "inprog": state.service.reports() }))
}

async fn health(State(state): State<CoordState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": state.service.service_name(),
        "is_primary": state.service.is_primary(),
        "term": state.service.term(),
        "live_instances": state.service.instances().len(),
        "version": crate::VERSION,
        "build": crate::BUILD_INFO,
    }))
}

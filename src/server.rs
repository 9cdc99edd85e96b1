//! HTTP entry point for the reconciliation worker.
//!
//! One POST endpoint dispatching on the `action` query parameter, plus the
//! monitoring routes. Authentication happens before any action runs; every
//! error becomes a `{ "error": message }` body with the mapped status code,
//! never a stack trace.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::auth::Authenticator;
use crate::engine::{CreateOrderRequest, ReconcileEngine};
use crate::error::WorkerError;
use crate::metrics;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconcileEngine>,
    pub auth: Arc<dyn Authenticator>,
}

#[derive(Debug, Deserialize)]
struct ActionQuery {
    action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckStatusBody {
    #[serde(rename = "externalOrderId")]
    external_order_id: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    timestamp: i64,
}

/// Build the worker's router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(dispatch).options(preflight))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .layer(middleware::map_response(attach_cors_headers))
        .with_state(state)
}

/// Preflights answer 204 with the fixed headers (added by the middleware).
async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// The CORS surface is fixed: any origin, the four headers the storefront
/// sends.
async fn attach_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("authorization, x-client-info, apikey, content-type"),
    );
    response
}

/// Bind and serve until ctrl-c.
pub async fn run(state: AppState, port: u16) -> Result<(), WorkerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(state);

    tracing::info!("worker listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| WorkerError::Internal(format!("failed to bind {addr}: {e}")))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .map_err(|e| WorkerError::Internal(format!("server failed: {e}")))
}

async fn dispatch(
    State(state): State<AppState>,
    Query(query): Query<ActionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_action(&state, query, &headers, &body).await {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_action(
    state: &AppState,
    query: ActionQuery,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<serde_json::Value, WorkerError> {
    let token = bearer_token(headers)?;
    state.auth.verify(token).await?;

    let action = query
        .action
        .ok_or_else(|| WorkerError::BadRequest("missing action parameter".into()))?;

    match action.as_str() {
        "create_order" => {
            let request: CreateOrderRequest = parse_body(body)?;
            if request.quantity == 0 {
                return Err(WorkerError::BadRequest("quantity must be positive".into()));
            }
            let external_order_id = state.engine.create_order(request).await?;
            Ok(json!({
                "success": true,
                "external_order_id": external_order_id,
            }))
        }
        "check_status" => {
            let request: CheckStatusBody = parse_body(body)?;
            let report = state.engine.check_status(&request.external_order_id).await?;
            Ok(json!({
                "success": true,
                "status": report.status,
                "start_count": report.start_count,
                "remains": report.remains,
                "charge": report.charge,
            }))
        }
        "bulk_status_check" => {
            let report = state.engine.sweep().await?;
            Ok(json!({
                "success": true,
                "updated_orders": report.succeeded,
                "attempted": report.attempted,
                "failed": report.failed,
                "duration_ms": report.duration_ms,
            }))
        }
        other => Err(WorkerError::BadRequest(format!("invalid action: {other}"))),
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, WorkerError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .ok_or(WorkerError::Unauthorized)
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, WorkerError> {
    serde_json::from_slice(body)
        .map_err(|e| WorkerError::BadRequest(format!("malformed request body: {e}")))
}

fn error_response(e: WorkerError) -> Response {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(error = %e, "request failed");
    }
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().timestamp(),
    })
}

async fn metrics_endpoint() -> String {
    metrics::gather_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "abc123");
    }

    #[test]
    fn test_bearer_token_missing_or_malformed() {
        let headers = HeaderMap::new();
        assert!(matches!(
            bearer_token(&headers),
            Err(WorkerError::Unauthorized)
        ));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert!(bearer_token(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn test_parse_body_rejects_garbage() {
        let body = Bytes::from_static(b"not json");
        let parsed: Result<CheckStatusBody, _> = parse_body(&body);
        assert!(matches!(parsed, Err(WorkerError::BadRequest(_))));
    }
}

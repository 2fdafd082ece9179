//! Axum front end for the nimbus control plane: registration, invocation,
//! execution lookup/watch and the internal completion callback.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::error;

use nimbus_common::{FunctionSpec, InvocationRequest};
use nimbus_control::registry::FunctionService;
use nimbus_control::service::InvocationService;
use nimbus_control::store::ExecutionSnapshot;
use nimbus_control::Error as ControlError;
use nimbus_gateway::{CompletionCallback, ErrorBody, ExecutionStatusResponse, InvokeResponse};

pub mod config;

pub const EXECUTION_ID_HEADER: &str = "X-Execution-Id";
pub const REJECT_REASON_HEADER: &str = "X-Queue-Reject-Reason";

#[derive(Clone)]
pub struct AppState {
    pub functions: Arc<FunctionService>,
    pub invocations: Arc<InvocationService>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        // Registry
        .route(
            "/v1/functions",
            post(register_function_handler).get(list_functions_handler),
        )
        .route(
            "/v1/functions/:name",
            get(get_function_handler).delete(delete_function_handler),
        )
        // Invocation path
        .route("/v1/functions/:name/invoke", post(invoke_handler))
        .route("/v1/functions/:name/enqueue", post(enqueue_handler))
        // Execution lookup and the runtime completion callback
        .route("/v1/executions/:id", get(get_execution_handler))
        .route(
            "/v1/internal/executions/:id/complete",
            post(complete_execution_handler),
        )
        .route("/healthz", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn register_function_handler(
    State(state): State<AppState>,
    Json(spec): Json<FunctionSpec>,
) -> Response {
    match state.functions.register(spec) {
        Ok(resolved) => (StatusCode::CREATED, Json((*resolved).clone())).into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_functions_handler(State(state): State<AppState>) -> Json<Vec<FunctionSpec>> {
    Json(
        state
            .functions
            .list()
            .into_iter()
            .map(|spec| (*spec).clone())
            .collect(),
    )
}

async fn get_function_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.functions.get(&name) {
        Some(spec) => Json((*spec).clone()).into_response(),
        None => not_found("function_not_found", format!("no function named '{name}'")),
    }
}

async fn delete_function_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.functions.remove(&name) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn invoke_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(request): Json<InvocationRequest>,
) -> Response {
    let idempotency_key = header_string(&headers, "Idempotency-Key");
    let trace_id = header_string(&headers, "X-Trace-Id");
    let timeout_ms = header_string(&headers, "X-Timeout-Ms").and_then(|v| v.parse().ok());

    match state
        .invocations
        .invoke(&name, request, idempotency_key, trace_id, timeout_ms)
        .await
    {
        Ok(outcome) => {
            let execution_id = outcome.execution_id.clone();
            let mut response =
                Json(InvokeResponse::from_result(outcome.execution_id, outcome.result))
                    .into_response();
            set_header(&mut response, EXECUTION_ID_HEADER, &execution_id);
            response
        }
        Err(err) => error_response(err),
    }
}

async fn enqueue_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(request): Json<InvocationRequest>,
) -> Response {
    let idempotency_key = header_string(&headers, "Idempotency-Key");
    let trace_id = header_string(&headers, "X-Trace-Id");
    match state
        .invocations
        .enqueue(&name, request, idempotency_key, trace_id)
    {
        Ok(execution_id) => (
            StatusCode::ACCEPTED,
            Json(InvokeResponse::queued(execution_id)),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct WatchParams {
    #[serde(default)]
    watch: bool,
    poll_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

async fn get_execution_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<WatchParams>,
) -> Response {
    let Some(mut snapshot) = state.invocations.status(&id) else {
        return not_found("execution_not_found", format!("no execution '{id}'"));
    };

    if params.watch {
        let poll = Duration::from_millis(params.poll_ms.unwrap_or(500).max(10));
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(params.timeout_ms.unwrap_or(30_000));
        while !snapshot.state.is_terminal() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(poll).await;
            match state.invocations.status(&id) {
                Some(latest) => snapshot = latest,
                None => {
                    return not_found("execution_not_found", format!("no execution '{id}'"));
                }
            }
        }
    }

    Json(to_status_response(snapshot)).into_response()
}

async fn complete_execution_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(callback): Json<CompletionCallback>,
) -> Response {
    if state.invocations.complete_execution(&id, callback.into()).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found("execution_not_found", format!("no execution '{id}'"))
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

fn to_status_response(snapshot: ExecutionSnapshot) -> ExecutionStatusResponse {
    ExecutionStatusResponse {
        execution_id: snapshot.execution_id,
        status: snapshot.state.as_str().to_string(),
        started_at: snapshot.started_at,
        finished_at: snapshot.finished_at,
        output: snapshot.output,
        error: snapshot.last_error,
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

fn set_header(response: &mut Response, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::try_from(name.to_string()),
        HeaderValue::from_str(value),
    ) {
        response.headers_mut().insert(name, value);
    }
}

/// Control-plane errors to HTTP. Backpressure is a 429 with an advisory
/// retry interval and a machine-readable reason, never a server error.
fn error_response(err: ControlError) -> Response {
    match err {
        ControlError::FunctionNotFound(name) => {
            not_found("function_not_found", format!("no function named '{name}'"))
        }
        ControlError::FunctionExists(name) => (
            StatusCode::CONFLICT,
            Json(ErrorBody::new(
                "function_exists",
                format!("function '{name}' is already registered"),
            )),
        )
            .into_response(),
        ControlError::Rejected {
            reason,
            retry_after_seconds,
        } => {
            let mut body = ErrorBody::new(reason.as_str(), "invocation rejected, retry later");
            body.retry_after_seconds = Some(retry_after_seconds);
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            set_header(
                &mut response,
                "Retry-After",
                &retry_after_seconds.to_string(),
            );
            set_header(&mut response, REJECT_REASON_HEADER, reason.as_str());
            response
        }
        ControlError::Common(inner) => {
            error!(error = %inner, "request failed");
            match inner {
                nimbus_common::NimbusError::SpecInvalid(message) => (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorBody::new("spec_invalid", message)),
                )
                    .into_response(),
                _ => internal_error(),
            }
        }
        other => {
            error!(error = %other, "request failed");
            internal_error()
        }
    }
}

fn not_found(code: &str, message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody::new(code, message))).into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody::new("internal", "internal error")),
    )
        .into_response()
}

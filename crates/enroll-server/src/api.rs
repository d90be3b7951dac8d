//! JSON control routes under `/api/sessions`.
//!
//! Every response is wrapped in `{success, message, data}`. Runtime errors
//! map onto HTTP statuses through [`status_for`].

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use enroll_core::ids::SessionId;
use enroll_core::portal::Credentials;
use enroll_runtime::RuntimeError;
use enroll_runtime::orchestrator::Outcome;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::server::AppState;

/// Response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// Whether the operation did what was asked.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
    /// Operation result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Successful response.
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

type Reply<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

fn reply<T: Serialize>(status: StatusCode, body: ApiResponse<T>) -> Reply<T> {
    Ok((status, Json(body)))
}

/// HTTP-facing error.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    category: &'static str,
    message: String,
}

impl ApiError {
    /// 400 with `message`.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            category: "invalid_request",
            message: message.into(),
        }
    }

    /// 403 with `message`.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            category: "forbidden",
            message: message.into(),
        }
    }

    /// Status this error renders with.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// HTTP status for a runtime error.
pub fn status_for(err: &RuntimeError) -> StatusCode {
    match err {
        RuntimeError::Auth(_) => StatusCode::UNAUTHORIZED,
        RuntimeError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        RuntimeError::AlreadyRunning(_)
        | RuntimeError::NotReady(_)
        | RuntimeError::InvalidTransition { .. }
        | RuntimeError::Extraction(_)
        | RuntimeError::Cancelled => StatusCode::CONFLICT,
        RuntimeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        RuntimeError::Portal(_)
        | RuntimeError::TokenInvalid(_)
        | RuntimeError::TransientFailure(_)
        | RuntimeError::FatalFailure(_) => StatusCode::BAD_GATEWAY,
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        Self {
            status: status_for(&err),
            category: err.category(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, category = self.category, error = %self.message, "request failed");
        } else {
            debug!(status = %self.status, category = self.category, error = %self.message, "request refused");
        }
        let body = ApiResponse {
            success: false,
            message: self.message,
            data: Some(json!({ "category": self.category })),
        };
        (self.status, Json(body)).into_response()
    }
}

/// Body of `POST /api/sessions/{id}/search`.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    /// Course keyword.
    #[serde(default)]
    pub keyword: String,
}

/// Body of `POST /api/sessions/{id}/select`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectRequest {
    /// Start a background retry task instead of a single submit.
    #[serde(default)]
    pub auto_retry: bool,
}

/// The `/api` routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route(
            "/api/sessions/{id}",
            get(session_status).delete(destroy_session),
        )
        .route("/api/sessions/{id}/search", post(search))
        .route("/api/sessions/{id}/select", post(select))
        .route("/api/sessions/{id}/stop", post(stop))
        .route("/api/shutdown", post(shutdown))
}

async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Reply<Value> {
    let Json(credentials) = payload?;
    if credentials.username.trim().is_empty() || credentials.password.is_empty() {
        return Err(ApiError::bad_request("username and password are required"));
    }
    let created = state.service.create_session(&credentials).await?;
    reply(
        StatusCode::CREATED,
        ApiResponse::ok("signed on", json!(created)),
    )
}

async fn session_status(State(state): State<AppState>, Path(id): Path<String>) -> Reply<Value> {
    let status = state.service.status(&SessionId::from(id))?;
    reply(StatusCode::OK, ApiResponse::ok("session status", json!(status)))
}

async fn destroy_session(State(state): State<AppState>, Path(id): Path<String>) -> Reply<Value> {
    let id = SessionId::from(id);
    state.service.destroy_session(&id)?;
    reply(
        StatusCode::OK,
        ApiResponse::ok("session destroyed", json!({ "sessionId": id })),
    )
}

async fn search(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Reply<Value> {
    let Json(request) = payload?;
    let outcome = state
        .service
        .search(&SessionId::from(id), &request.keyword)
        .await?;
    let message = if outcome.selector_ready {
        "course found and token acquired"
    } else if outcome.has_results {
        "course found but no usable token"
    } else {
        "no matching courses"
    };
    reply(StatusCode::OK, ApiResponse::ok(message, json!(outcome)))
}

async fn select(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Reply<Value> {
    let request: SelectRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SelectRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(e.to_string()))?
    };
    let id = SessionId::from(id);

    if request.auto_retry {
        let handle = state.service.start_auto_select(&id)?;
        return reply(
            StatusCode::ACCEPTED,
            ApiResponse::ok("auto-select started", json!(handle)),
        );
    }

    let outcome = state.service.run_once_select(&id).await?;
    let body = match &outcome {
        Outcome::Success { message, .. } => ApiResponse::ok(message.clone(), json!(outcome)),
        Outcome::Failure { reason, .. } => ApiResponse {
            success: false,
            message: reason.clone(),
            data: Some(json!(outcome)),
        },
    };
    reply(StatusCode::OK, body)
}

async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> Reply<Value> {
    let ack = state.service.stop_auto_select(&SessionId::from(id))?;
    reply(
        StatusCode::OK,
        ApiResponse::ok("stop acknowledged", json!({ "stop": ack })),
    )
}

/// Destroy every session and stop the server. Refused unless
/// `server.allowRemoteShutdown` is set.
async fn shutdown(State(state): State<AppState>) -> Reply<Value> {
    if !state.config.allow_remote_shutdown {
        return Err(ApiError::forbidden("remote shutdown is disabled"));
    }
    let destroyed = state.service.shutdown();
    state.shutdown.shutdown();
    info!(destroyed, "shutdown requested over HTTP");
    reply(
        StatusCode::ACCEPTED,
        ApiResponse::ok("shutting down", json!({ "destroyedSessions": destroyed })),
    )
}

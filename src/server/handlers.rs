//! Request handlers

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, info};

use super::AppState;
use crate::error::{OrchestratorError, PermissionError};
use crate::protocol::{encode_json, PermissionDecision, StartRequest};

/// Header naming the session a stream belongs to
pub const SESSION_HEADER: &str = "x-session-id";

fn error_body(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

fn not_found(session_id: &str, what: &str) -> Response {
    error_body(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("session {session_id} has no {what}"),
    )
}

/// `POST /api/v1/sessions/{session_id}/stream`
pub async fn start_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_body(
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation",
                rejection.body_text(),
            )
        }
    };

    let turn = match state.orchestrator.start(&session_id, request).await {
        Ok(turn) => turn,
        Err(e) => {
            debug!(session_id = %session_id, error = %e, "stream start refused");
            let (status, code) = match e {
                OrchestratorError::SessionBusy(_) => (StatusCode::CONFLICT, "session_busy"),
                OrchestratorError::Validation(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, e.code().as_str())
                }
            };
            return error_body(status, code, e.to_string());
        }
    };

    let frames = turn.map(|event| {
        encode_json(&event).map(|data| Event::default().event(event.kind()).data(data))
    });

    (
        [(SESSION_HEADER, session_id)],
        Sse::new(frames).keep_alive(KeepAlive::new().interval(state.keep_alive).text("ping")),
    )
        .into_response()
}

/// `POST /api/v1/sessions/{session_id}/permissions`
pub async fn resolve_permission(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<PermissionDecision>, JsonRejection>,
) -> Response {
    let Json(decision) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_body(
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation",
                rejection.body_text(),
            )
        }
    };

    match state.orchestrator.resolve(&session_id, decision).await {
        Ok(()) => Json(json!({ "status": "resolved" })).into_response(),
        Err(PermissionError::Stale(id)) => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "not_pending",
                "message": format!("permission request {id} is not pending"),
            })),
        )
            .into_response(),
    }
}

/// `GET /api/v1/sessions/{session_id}/permissions`
pub async fn pending_permission(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let Some(pending) = state.orchestrator.pending(&session_id) else {
        return not_found(&session_id, "pending permission request");
    };
    let awaiting_ms = u64::try_from(pending.awaiting.as_millis()).unwrap_or(u64::MAX);
    Json(json!({
        "request": pending.request,
        "awaitingMs": awaiting_ms,
    }))
    .into_response()
}

/// `POST /api/v1/sessions/{session_id}/cancel`
pub async fn cancel_turn(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let cancelled = state.orchestrator.cancel(&session_id);
    info!(session_id = %session_id, cancelled, "cancel requested");
    Json(json!({ "cancelled": cancelled })).into_response()
}

/// `GET /api/v1/sessions/{session_id}`
pub async fn session_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    state.orchestrator.state(&session_id).map_or_else(
        || not_found(&session_id, "live turn"),
        |snapshot| Json(snapshot).into_response(),
    )
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "activeSessions": state.orchestrator.active_sessions(),
    }))
    .into_response()
}

//! Read-only REST endpoints: session history, the incident journal and avatar tokens.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{error, warn};

use relay_core::ids::SessionId;
use relay_store::StoreError;
use relay_telemetry::IncidentQuery;

use crate::server::AppState;

const MAX_PAGE: u32 = 500;

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
}

/// `GET /api/sessions?limit=N`
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Response {
    let Some(reader) = state.history.clone() else {
        return Json(serde_json::json!([])).into_response();
    };
    let limit = params.limit.unwrap_or(state.history_limit).clamp(1, MAX_PAGE);

    match tokio::task::spawn_blocking(move || reader.list_sessions(limit)).await {
        Ok(Ok(sessions)) => Json(sessions).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "failed to list sessions");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch sessions")
        }
        Err(e) => {
            error!(error = %e, "session list task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch sessions")
        }
    }
}

/// `GET /api/sessions/{id}`
pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(reader) = state.history.clone() else {
        return error_response(StatusCode::NOT_FOUND, "Session not found");
    };
    let session_id = SessionId::from_raw(id);

    let result = tokio::task::spawn_blocking(move || reader.session_history(&session_id)).await;
    match result {
        Ok(Ok(history)) => Json(history).into_response(),
        Ok(Err(StoreError::NotFound(_))) => error_response(StatusCode::NOT_FOUND, "Session not found"),
        Ok(Err(e)) => {
            error!(error = %e, "failed to load session history");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch session history",
            )
        }
        Err(e) => {
            error!(error = %e, "session history task failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch session history",
            )
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentParams {
    pub level: Option<String>,
    pub kind: Option<String>,
    pub session_id: Option<String>,
    pub connection_id: Option<String>,
    pub limit: Option<u32>,
}

/// `GET /api/logs`: journaled incidents, newest first. `[]` when the journal is off.
pub async fn list_incidents(
    State(state): State<AppState>,
    Query(params): Query<IncidentParams>,
) -> Response {
    let Some(journal) = state.incidents.clone() else {
        return Json(serde_json::json!([])).into_response();
    };
    let query = IncidentQuery {
        level: params.level,
        kind: params.kind,
        connection_id: params.connection_id,
        session_id: params.session_id,
        limit: params.limit.map(|l| l.clamp(1, MAX_PAGE)),
    };

    match tokio::task::spawn_blocking(move || journal.recent(&query)).await {
        Ok(Ok(incidents)) => Json(incidents).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "failed to query incidents");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch logs")
        }
        Err(e) => {
            error!(error = %e, "incident query task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch logs")
        }
    }
}

/// `POST /api/heygen/token`
pub async fn avatar_token(State(state): State<AppState>) -> Response {
    match state.avatar.create_token().await {
        Ok(token) => Json(token).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to create avatar token");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

//! Session listing for operators.
//!
//! - `GET /api/v1/sessions`: every live session
//! - `GET /api/v1/sessions/{client_id}`: one session, 404 if the client has none

use crate::error::{AppError, AppResult};
use crate::session::SessionSummary;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let registry = state.manager.registry();
    let mut sessions: Vec<SessionSummary> = registry
        .list()
        .await
        .iter()
        .map(|session| session.summary())
        .collect();
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "max_sessions": registry.capacity(),
        "sessions": sessions
    })))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let client_id = path.into_inner();
    let session = state
        .manager
        .registry()
        .get(&client_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("No live session for client '{}'", client_id)))?;

    Ok(HttpResponse::Ok().json(session.summary()))
}

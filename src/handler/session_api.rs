use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use serde::Serialize;

use crate::api::AppState;

pub fn session_router() -> Router<AppState> {
    Router::new()
        .route("/list", get(list_sessions))
        .route("/status/{id}", get(session_status))
}

#[derive(Serialize)]
struct SessionStatus {
    id: String,
    state: String,
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.registry.ids().await)
}

async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Option<SessionStatus>> {
    let status = state.registry.get(&id).await.map(|s| SessionStatus {
        id: s.id().to_string(),
        state: s.state().to_string(),
    });
    Json(status)
}

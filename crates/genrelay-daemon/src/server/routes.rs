//! JSON request handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use genrelay_core::api::{
    ActiveQuery, ActiveResponse, ClearResponse, CommandBody, CommandsResponse, ContextResponse,
    GenerateRequest, GenerateResponse, MessagesResponse, SavedCommand, SessionQuery, StopRequest,
    StopResponse,
};
use serde_json::json;

use crate::relay::{GenerationRelay, RelayError};

pub(super) async fn generate(
    State(relay): State<Arc<GenerationRelay>>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, RelayError> {
    relay.submit(request).await.map(Json)
}

pub(super) async fn status(
    State(relay): State<Arc<GenerationRelay>>,
    Path(response_id): Path<String>,
) -> Response {
    match relay.status(&response_id).await {
        Some(status) => Json(status).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "not_found"})),
        )
            .into_response(),
    }
}

pub(super) async fn active(
    State(relay): State<Arc<GenerationRelay>>,
    Query(query): Query<ActiveQuery>,
) -> Json<ActiveResponse> {
    Json(relay.active(&query).await)
}

pub(super) async fn stop(
    State(relay): State<Arc<GenerationRelay>>,
    Json(request): Json<StopRequest>,
) -> Result<Json<StopResponse>, RelayError> {
    relay.stop(&request).await.map(Json)
}

pub(super) async fn health() -> &'static str {
    "ok"
}

pub(super) async fn clear(
    State(relay): State<Arc<GenerationRelay>>,
    Json(query): Json<SessionQuery>,
) -> Result<Json<ClearResponse>, RelayError> {
    relay.clear(&query.session_id).await.map(Json)
}

pub(super) async fn context(
    State(relay): State<Arc<GenerationRelay>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<ContextResponse>, RelayError> {
    relay.context(&query.session_id).await.map(Json)
}

pub(super) async fn messages(
    State(relay): State<Arc<GenerationRelay>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<MessagesResponse>, RelayError> {
    relay.messages(&query.session_id).await.map(Json)
}

pub(super) async fn commands(
    State(relay): State<Arc<GenerationRelay>>,
) -> Result<Json<CommandsResponse>, RelayError> {
    relay.commands().await.map(Json)
}

pub(super) async fn save_command(
    State(relay): State<Arc<GenerationRelay>>,
    Path(name): Path<String>,
    Json(body): Json<CommandBody>,
) -> Result<Json<SavedCommand>, RelayError> {
    relay.save_command(&name, &body.content).await.map(Json)
}

pub(super) async fn delete_command(
    State(relay): State<Arc<GenerationRelay>>,
    Path(name): Path<String>,
) -> Result<StatusCode, RelayError> {
    relay.delete_command(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

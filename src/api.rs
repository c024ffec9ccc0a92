use std::convert::Infallible;

use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post, put},
    Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::{
    app_state::AppState,
    chat::{self, SessionSnapshot, StreamEvent, UploadOutcome},
    error::AppError,
    models::FileKind,
    rag,
    session::SessionId,
};

// --- Payloads de la API ---

#[derive(Deserialize)]
pub struct ApiKeyPayload {
    api_key: String,
}

#[derive(Deserialize)]
pub struct ChatPayload {
    question: String,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    let body_limit = app_state.config.max_upload_bytes;
    Router::new()
        .route("/api/info", get(info_handler))
        .route("/api/sessions", post(create_session_handler))
        .route(
            "/api/sessions/:id",
            get(session_handler).delete(delete_session_handler),
        )
        .route("/api/sessions/:id/api-key", put(api_key_handler))
        .route("/api/sessions/:id/upload", post(upload_handler))
        .route("/api/sessions/:id/chat", post(chat_handler))
        .route("/api/sessions/:id/reset", post(reset_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn info_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let embedder = state.index_builder.embedder();
    Json(json!({
        "llm_model": state.llm_factory.model_name(),
        "embedding_model": embedder.model_name(),
        "similarity_top_k": state.config.similarity_top_k,
        "accepted_extensions": FileKind::ACCEPTED_EXTENSIONS,
        "unknown_answer": rag::UNKNOWN_ANSWER,
        "active_sessions": state.sessions.len(),
    }))
}

#[axum::debug_handler]
async fn create_session_handler(State(state): State<AppState>) -> impl IntoResponse {
    let id = state.sessions.create();
    (StatusCode::CREATED, Json(json!({ "session_id": id })))
}

#[axum::debug_handler]
async fn session_handler(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionSnapshot>, AppError> {
    Ok(Json(chat::snapshot(&state, id).await?))
}

#[axum::debug_handler]
async fn delete_session_handler(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<StatusCode, AppError> {
    if state.sessions.remove(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::SessionNotFound(id))
    }
}

#[axum::debug_handler]
async fn api_key_handler(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(payload): Json<ApiKeyPayload>,
) -> Result<StatusCode, AppError> {
    chat::set_api_key(&state, id, &payload.api_key).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn upload_handler(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    mut multipart: Multipart,
) -> Result<Json<UploadOutcome>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Formulario inválido: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::BadRequest("El fichero no tiene nombre.".to_string()))?;
        // Se rechaza antes de leer el cuerpo.
        if FileKind::from_filename(&name).is_none() {
            return Err(AppError::UnsupportedFile(name));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("No se pudo leer el fichero: {e}")))?;

        let file = chat::accept_upload(&name, bytes.to_vec())?;
        return Ok(Json(chat::upload(&state, id, file).await?));
    }
    Err(AppError::BadRequest("Falta el campo 'file'.".to_string()))
}

#[axum::debug_handler]
async fn chat_handler(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(payload): Json<ChatPayload>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let events = chat::ask(&state, id, &payload.question).await?;
    let stream = ReceiverStream::new(events).map(|event| Ok(to_sse_event(event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Los datos van en JSON para conservar saltos de línea dentro de los fragmentos.
fn to_sse_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Token(fragment) => Event::default().event("token").data(json!(fragment).to_string()),
        StreamEvent::Done => Event::default().event("done").data("{}"),
        StreamEvent::Error(message) => Event::default()
            .event("error")
            .data(json!({ "error": message }).to_string()),
    }
}

#[axum::debug_handler]
async fn reset_handler(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<StatusCode, AppError> {
    chat::reset(&state, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Handler de Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    let sender = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    StatusCode::OK
}

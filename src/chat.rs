//! Ciclo de interacción de una sesión: subida + indexación (con caché por
//! fichero), preguntas con respuesta en streaming y reinicio del historial.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{
    app_state::AppState,
    error::AppError,
    ingest,
    llm::AnswerModelFactory,
    models::{ChatTurn, FileKind, TablePreview, UploadedFile},
    rag::{PromptTemplate, QueryEngine},
    session::SessionId,
};

/// Eventos que recibe el navegador durante un turno de chat.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Done,
    Error(String),
}

#[derive(Debug, Serialize)]
pub struct UploadOutcome {
    pub filename: String,
    pub cached: bool,
    pub chunks: usize,
    pub preview: Option<TablePreview>,
    pub preview_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Idle,
    Indexed,
}

#[derive(Debug, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: ChatState,
    pub active_file: Option<String>,
    pub cached_files: usize,
    pub has_api_key: bool,
    pub messages: Vec<ChatTurn>,
}

/// Valida nombre y extensión del fichero recibido.
pub fn accept_upload(name: &str, bytes: Vec<u8>) -> Result<UploadedFile, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("El fichero no tiene nombre.".to_string()));
    }
    let kind = FileKind::from_filename(name)
        .ok_or_else(|| AppError::UnsupportedFile(name.to_string()))?;
    Ok(UploadedFile {
        name: name.to_string(),
        kind,
        bytes,
    })
}

/// Ingiere e indexa el fichero salvo que ya esté en la caché de la sesión.
/// Un fallo de ingesta o indexación no deja nada en la caché.
pub async fn upload(
    state: &AppState,
    id: SessionId,
    file: UploadedFile,
) -> Result<UploadOutcome, AppError> {
    let shared = state.sessions.get(id)?;
    let mut session = shared.lock().await;
    let key = session.key_for(&file.name);

    let (engine, cached) = match session.cache.get(&key) {
        Some(engine) => {
            info!("'{}' ya indexado en la sesión {id}, se reutiliza.", file.name);
            (engine, true)
        }
        None => {
            info!("Indexando '{}' ({} bytes)...", file.name, file.bytes.len());
            let docs = ingest::load_documents(&file)
                .await
                .map_err(AppError::Ingestion)?;
            let index = state
                .index_builder
                .build(&docs)
                .await
                .map_err(AppError::Indexing)?;
            let engine = Arc::new(QueryEngine::new(
                index,
                PromptTemplate::qa(),
                state.config.similarity_top_k,
                state.index_builder.embedder(),
            ));
            session.cache.insert(key, engine.clone());
            (engine, false)
        }
    };
    session.active_file = Some(file.name.clone());

    let preview = ingest::preview(&file, state.config.preview_max_rows).await;
    let (preview, preview_error) = match preview {
        Ok(preview) => (Some(preview), None),
        Err(e) => {
            warn!("No se pudo mostrar la vista previa de '{}': {e:#}", file.name);
            (None, Some(format!("{e:#}")))
        }
    };

    Ok(UploadOutcome {
        filename: file.name,
        cached,
        chunks: engine.chunk_count(),
        preview,
        preview_error,
    })
}

/// Registra la pregunta y lanza el turno. La sesión queda bloqueada hasta que
/// el streaming termina; la respuesta sólo se añade al historial si termina bien.
pub async fn ask(
    state: &AppState,
    id: SessionId,
    question: &str,
) -> Result<mpsc::Receiver<StreamEvent>, AppError> {
    let question = question.trim().to_string();
    if question.is_empty() {
        return Err(AppError::BadRequest("La pregunta está vacía.".to_string()));
    }

    let shared = state.sessions.get(id)?;
    let mut session = shared.lock_owned().await;
    let engine = session.active_engine().ok_or(AppError::NoActiveDocument)?;

    session.transcript.push(ChatTurn::user(question.clone()));
    let api_key = session.api_key.clone();
    let factory = state.llm_factory.clone();
    let (events_tx, events_rx) = mpsc::channel(64);

    tokio::spawn(async move {
        info!("Pregunta en la sesión {id}: {question}");
        let outcome = answer_turn(
            &engine,
            factory.as_ref(),
            api_key.as_deref(),
            &question,
            &events_tx,
        )
        .await;

        match outcome {
            Ok(Some(answer)) => {
                session.transcript.push(ChatTurn::assistant(answer));
                drop(session);
                let _ = events_tx.send(StreamEvent::Done).await;
            }
            Ok(None) => {
                info!("El navegador cerró el stream de la sesión {id}; la respuesta se descarta.");
            }
            Err(e) => {
                drop(session);
                error!("Error en la consulta de la sesión {id}: {e}");
                let _ = events_tx.send(StreamEvent::Error(e.to_string())).await;
            }
        }
    });

    Ok(events_rx)
}

/// Reenvía los fragmentos al navegador y los concatena. `None` si el
/// navegador dejó de escuchar.
async fn answer_turn(
    engine: &QueryEngine,
    factory: &dyn AnswerModelFactory,
    api_key: Option<&str>,
    question: &str,
    events: &mpsc::Sender<StreamEvent>,
) -> Result<Option<String>, AppError> {
    let llm = factory.connect(api_key).map_err(AppError::Query)?;

    let (fragments_tx, mut fragments_rx) = mpsc::channel::<String>(32);
    let produce = engine.query(question, llm.as_ref(), fragments_tx);
    let consume = async move {
        let mut answer = String::new();
        while let Some(fragment) = fragments_rx.recv().await {
            answer.push_str(&fragment);
            if events.send(StreamEvent::Token(fragment)).await.is_err() {
                return None;
            }
        }
        Some(answer)
    };

    let (result, answer) = tokio::join!(produce, consume);
    result.map_err(AppError::Query)?;
    Ok(answer)
}

pub async fn set_api_key(state: &AppState, id: SessionId, api_key: &str) -> Result<(), AppError> {
    let shared = state.sessions.get(id)?;
    let mut session = shared.lock().await;
    let api_key = api_key.trim();
    session.api_key = (!api_key.is_empty()).then(|| api_key.to_string());
    Ok(())
}

/// "Limpiar": vacía el historial; los índices ya construidos siguen disponibles.
pub async fn reset(state: &AppState, id: SessionId) -> Result<(), AppError> {
    let shared = state.sessions.get(id)?;
    let mut session = shared.lock().await;
    let discarded = session.transcript.len();
    session.reset_chat();
    info!("Historial de la sesión {id} reiniciado ({discarded} turnos descartados).");
    Ok(())
}

pub async fn snapshot(state: &AppState, id: SessionId) -> Result<SessionSnapshot, AppError> {
    let shared = state.sessions.get(id)?;
    let session = shared.lock().await;
    let chat_state = if session.active_engine().is_some() {
        ChatState::Indexed
    } else {
        ChatState::Idle
    };
    Ok(SessionSnapshot {
        session_id: id,
        state: chat_state,
        active_file: session.active_file.clone(),
        cached_files: session.cache.len(),
        has_api_key: session.api_key.is_some(),
        messages: session.transcript.turns().to_vec(),
    })
}

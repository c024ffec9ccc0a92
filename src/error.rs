//! Taxonomía de errores visibles para el usuario.
//!
//! Cada error se captura en el límite de la acción que lo provocó y se
//! devuelve como `{"error", "kind"}`. No hay reintentos: el usuario vuelve a
//! lanzar la acción tras corregir la causa.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

use crate::session::SessionId;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Error al leer el fichero: {0:#}")]
    Ingestion(anyhow::Error),

    #[error("Error al construir el índice: {0:#}")]
    Indexing(anyhow::Error),

    #[error("Error al consultar el LLM: {0:#}")]
    Query(anyhow::Error),

    #[error("Tipo de fichero no soportado: '{0}'. Se aceptan .csv, .xls y .xlsx")]
    UnsupportedFile(String),

    #[error("Sesión desconocida: {0}")]
    SessionNotFound(SessionId),

    #[error("Primero debe subir un fichero.")]
    NoActiveDocument,

    #[error("{0}")]
    BadRequest(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ingestion(_) => "ingestion",
            Self::Indexing(_) => "indexing",
            Self::Query(_) => "query",
            Self::UnsupportedFile(_) => "unsupported_file",
            Self::SessionNotFound(_) => "session_not_found",
            Self::NoActiveDocument => "no_active_document",
            Self::BadRequest(_) => "bad_request",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Ingestion(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Indexing(_) | Self::Query(_) => StatusCode::BAD_GATEWAY,
            Self::UnsupportedFile(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::NoActiveDocument => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status(),
            Json(json!({ "error": self.to_string(), "kind": self.kind() })),
        )
            .into_response()
    }
}

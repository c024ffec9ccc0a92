//! Modelos de dominio: ficheros subidos, documentos, chunks y turnos de chat.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tipos de fichero aceptados por el control de subida.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Csv,
    Xls,
    Xlsx,
}

impl FileKind {
    pub const ACCEPTED_EXTENSIONS: [&'static str; 3] = [".csv", ".xls", ".xlsx"];

    /// Deduce el tipo a partir de la extensión declarada (sin distinguir mayúsculas).
    pub fn from_filename(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "xls" => Some(Self::Xls),
            "xlsx" => Some(Self::Xlsx),
            _ => None,
        }
    }
}

/// Fichero recibido desde el navegador. Se consume en cuanto se ingiere.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub kind: FileKind,
    pub bytes: Vec<u8>,
}

/// Unidad lógica de texto (una hoja CSV completa o una hoja de Excel).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Trozo estructural de un documento; es lo que se embebe e indexa.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

impl Chunk {
    /// Texto tal y como lo ven el modelo de embeddings y el LLM:
    /// primero los metadatos `clave: valor`, luego una línea en blanco y el texto.
    pub fn content_for_llm(&self) -> String {
        if self.metadata.is_empty() {
            return self.text.clone();
        }
        let header: Vec<String> = self
            .metadata
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();
        format!("{}\n\n{}", header.join("\n"), self.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Un turno del historial de chat.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Vista previa tabular que se muestra en la barra lateral.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TablePreview {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub total_rows: usize,
    pub truncated: bool,
}

//! Carga y gestión de configuración de la aplicación (LLM, embeddings, servidor).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Proveedor del modelo de embeddings. El modelo es fijo por configuración,
/// el usuario no lo elige desde la interfaz.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    OpenAI,
    Ollama,
}

impl EmbeddingProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor de embeddings no soportado: {other}")),
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAI => "text-embedding-3-small",
            Self::Ollama => "bge-large",
        }
    }

    fn default_dimensions(&self) -> usize {
        match self {
            Self::OpenAI => 1536,
            Self::Ollama => 1024,
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub frontend_dir: String,
    pub open_browser: bool,

    pub llm_chat_model: String,
    pub llm_request_timeout: Duration,

    pub embedding_provider: EmbeddingProvider,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub embed_batch_size: usize,
    /// Servidor de Ollama; sólo se usa con el proveedor `ollama`.
    pub ollama_base_url: String,

    pub similarity_top_k: usize,
    pub chunk_max_chars: usize,
    pub preview_max_rows: usize,
    pub max_upload_bytes: usize,
    /// Una sesión sin peticiones durante este tiempo se descarta.
    pub session_idle_ttl: Duration,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    /// La clave de OpenRouter no se lee aquí: la introduce el usuario en la UI.
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8501".to_string());
        let frontend_dir = env::var("FRONTEND_DIR").unwrap_or_else(|_| "frontend".to_string());
        let open_browser = parse_var("OPEN_BROWSER", true)?;

        let llm_chat_model = env::var("LLM_CHAT_MODEL")
            .unwrap_or_else(|_| "meta-llama/llama-3.3-70b-instruct:free".to_string());
        let llm_request_timeout =
            Duration::from_secs(parse_var("LLM_REQUEST_TIMEOUT_SECS", 10_000u64)?);

        let provider_str =
            env::var("EMBEDDING_PROVIDER").unwrap_or_else(|_| "ollama".to_string());
        let embedding_provider = EmbeddingProvider::from_str(&provider_str)?;
        let embedding_model = env::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| embedding_provider.default_model().to_string());
        let embedding_dimensions = parse_var(
            "EMBEDDING_DIMENSIONS",
            embedding_provider.default_dimensions(),
        )?;
        let ollama_base_url = env::var("OLLAMA_API_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_OLLAMA_BASE_URL.to_string());

        let cfg = Self {
            server_addr,
            frontend_dir,
            open_browser,
            llm_chat_model,
            llm_request_timeout,
            embedding_provider,
            embedding_model,
            embedding_dimensions,
            embed_batch_size: parse_var("EMBED_BATCH_SIZE", 64)?,
            ollama_base_url,
            similarity_top_k: parse_var("SIMILARITY_TOP_K", 2)?,
            chunk_max_chars: parse_var("CHUNK_MAX_CHARS", 4000)?,
            preview_max_rows: parse_var("PREVIEW_MAX_ROWS", 200)?,
            max_upload_bytes: parse_var("MAX_UPLOAD_BYTES", 200 * 1024 * 1024)?,
            session_idle_ttl: Duration::from_secs(parse_var("SESSION_IDLE_TTL_SECS", 3600u64)?),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let positives = [
            ("EMBEDDING_DIMENSIONS", self.embedding_dimensions),
            ("EMBED_BATCH_SIZE", self.embed_batch_size),
            ("SIMILARITY_TOP_K", self.similarity_top_k),
            ("CHUNK_MAX_CHARS", self.chunk_max_chars),
            ("MAX_UPLOAD_BYTES", self.max_upload_bytes),
        ];
        for (name, value) in positives {
            if value == 0 {
                return Err(anyhow!("{name} debe ser mayor que cero"));
            }
        }
        if self.session_idle_ttl.is_zero() {
            return Err(anyhow!("SESSION_IDLE_TTL_SECS debe ser mayor que cero"));
        }
        Ok(())
    }
}

/// Lee una variable opcional; si existe pero no se puede interpretar es un error.
fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Valor inválido para {name}: '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl AppConfig {
    /// Configuración determinista para los tests (sin leer el entorno).
    pub fn for_tests() -> Self {
        Self {
            server_addr: "127.0.0.1:0".to_string(),
            frontend_dir: "frontend".to_string(),
            open_browser: false,
            llm_chat_model: "test/model".to_string(),
            llm_request_timeout: Duration::from_secs(5),
            embedding_provider: EmbeddingProvider::Ollama,
            embedding_model: "fake-embed".to_string(),
            embedding_dimensions: 32,
            embed_batch_size: 2,
            // Puerto "discard": nadie escucha, la conexión se rechaza.
            ollama_base_url: "http://127.0.0.1:9".to_string(),
            similarity_top_k: 2,
            chunk_max_chars: 4000,
            preview_max_rows: 200,
            max_upload_bytes: 1024 * 1024,
            session_idle_ttl: Duration::from_secs(60),
        }
    }
}

//! Abstracción sobre Rig para los servicios externos: el modelo de embeddings
//! (fijo por configuración) y el LLM remoto de OpenRouter con respuesta en
//! streaming.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use rig::embeddings::Embedding;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{AppConfig, EmbeddingProvider};

/// Calcula embeddings de una lista de textos, uno por texto y en orden.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Embedding>>;
}

/// LLM que responde a un prompt enviando fragmentos por el canal, en orden.
///
/// Si el receptor se cierra, la generación se abandona.
#[async_trait]
pub trait AnswerModel: Send + Sync {
    async fn stream_answer(&self, prompt: &str, fragments: mpsc::Sender<String>) -> Result<()>;
}

/// Crea un cliente de LLM con la clave que introduce el usuario.
pub trait AnswerModelFactory: Send + Sync {
    fn model_name(&self) -> &str;

    fn connect(&self, api_key: Option<&str>) -> Result<Arc<dyn AnswerModel>>;
}

// ---------------------------------------------------------------------
// EMBEDDINGS
// ---------------------------------------------------------------------

/// Embeddings vía Rig (Ollama local u OpenAI).
#[derive(Debug, Clone)]
pub struct RigEmbedder {
    provider: EmbeddingProvider,
    model: String,
    dimensions: usize,
    ollama_base_url: String,
}

impl RigEmbedder {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            provider: cfg.embedding_provider.clone(),
            model: cfg.embedding_model.clone(),
            dimensions: cfg.embedding_dimensions,
            ollama_base_url: cfg.ollama_base_url.clone(),
        }
    }

    async fn embed_with_ollama(&self, texts: Vec<String>) -> Result<Vec<Embedding>> {
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel as _;
        use rig::providers::ollama;

        let client = ollama::Client::builder()
            .base_url(&self.ollama_base_url)
            .build();
        let model = client.embedding_model_with_ndims(&self.model, self.dimensions);
        Ok(model.embed_texts(texts).await?)
    }

    async fn embed_with_openai(&self, texts: Vec<String>) -> Result<Vec<Embedding>> {
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel as _;
        use rig::providers::openai;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("Falta OPENAI_API_KEY para el modelo de embeddings"))?;
        let client = openai::Client::new(&api_key);
        let model = client.embedding_model(&self.model);
        Ok(model.embed_texts(texts).await?)
    }
}

#[async_trait]
impl Embedder for RigEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Embedding>> {
        let expected = texts.len();
        let embeddings = match self.provider {
            EmbeddingProvider::Ollama => self.embed_with_ollama(texts).await,
            EmbeddingProvider::OpenAI => self.embed_with_openai(texts).await,
        }
        .with_context(|| format!("Fallo del modelo de embeddings '{}'", self.model))?;

        if embeddings.len() != expected {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                expected
            ));
        }
        Ok(embeddings)
    }
}

// ---------------------------------------------------------------------
// CHAT / COMPLETION (streaming)
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OpenRouterFactory {
    model: String,
    timeout: Duration,
}

impl OpenRouterFactory {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            model: cfg.llm_chat_model.clone(),
            timeout: cfg.llm_request_timeout,
        }
    }
}

impl AnswerModelFactory for OpenRouterFactory {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn connect(&self, api_key: Option<&str>) -> Result<Arc<dyn AnswerModel>> {
        let api_key = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow!("Falta la clave de API de OpenRouter"))?;
        Ok(Arc::new(OpenRouterModel {
            api_key: api_key.to_string(),
            model: self.model.clone(),
            timeout: self.timeout,
        }))
    }
}

pub struct OpenRouterModel {
    api_key: String,
    model: String,
    timeout: Duration,
}

#[async_trait]
impl AnswerModel for OpenRouterModel {
    async fn stream_answer(&self, prompt: &str, fragments: mpsc::Sender<String>) -> Result<()> {
        use rig::agent::MultiTurnStreamItem;
        use rig::client::CompletionClient as _;
        use rig::providers::openrouter;
        use rig::streaming::{StreamedAssistantContent, StreamingPrompt};

        let client = openrouter::Client::new(&self.api_key);
        let agent = client.agent(&self.model).build();

        let mut stream = agent.stream_prompt(prompt).await;
        loop {
            let next = tokio::time::timeout(self.timeout, stream.next())
                .await
                .map_err(|_| anyhow!("El LLM no respondió en {:?}", self.timeout))?;
            let Some(item) = next else { break };

            match item {
                Ok(MultiTurnStreamItem::StreamItem(StreamedAssistantContent::Text(text))) => {
                    if fragments.send(text.text).await.is_err() {
                        warn!("Receptor cerrado, se abandona la generación.");
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(anyhow!("Error en el streaming del LLM: {e}")),
            }
        }
        debug!("Streaming del modelo '{}' terminado", self.model);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[test]
    fn openrouter_requires_a_key() {
        let factory = OpenRouterFactory::from_config(&AppConfig::for_tests());
        let connect = |key| factory.connect(key).map(|_| ());
        assert_err!(connect(None));
        assert_err!(connect(Some("   ")));
        assert_ok!(connect(Some("sk-or-test")));
    }

    #[tokio::test]
    async fn unreachable_ollama_is_an_error() {
        // Sin OLLAMA_API_BASE_URL en el entorno: se usa la URL de la configuración.
        std::env::remove_var("OLLAMA_API_BASE_URL");
        let embedder = RigEmbedder::from_config(&AppConfig::for_tests());
        let result = tokio::spawn(async move { embedder.embed_texts(vec!["hola".into()]).await })
            .await
            .expect("la tarea de embeddings no debe entrar en pánico");
        assert_err!(result);
    }

    #[test]
    fn model_names_come_from_config() {
        let cfg = AppConfig::for_tests();
        assert_eq!(OpenRouterFactory::from_config(&cfg).model_name(), cfg.llm_chat_model);
        assert_eq!(RigEmbedder::from_config(&cfg).model_name(), cfg.embedding_model);
    }
}

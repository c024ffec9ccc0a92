//! Dobles de prueba para los servicios externos (embeddings y LLM).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rig::embeddings::Embedding;
use tokio::sync::mpsc;

use crate::llm::{AnswerModel, AnswerModelFactory, Embedder};

/// Embeddings deterministas de bolsa de palabras: textos que comparten
/// palabras quedan cerca.
pub struct FakeEmbedder {
    dimensions: usize,
    calls: AtomicUsize,
    fail: bool,
}

impl FakeEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing(dimensions: usize) -> Self {
        Self {
            fail: true,
            ..Self::new(dimensions)
        }
    }

    /// Número de llamadas a `embed_texts`.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vectorize(&self, text: &str) -> Vec<f64> {
        let mut vec = vec![0.0; self.dimensions];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            let hash = word
                .bytes()
                .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));
            vec[(hash % self.dimensions as u64) as usize] += 1.0;
        }
        vec
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-embed"
    }

    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Embedding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("servicio de embeddings caído"));
        }
        Ok(texts
            .into_iter()
            .map(|text| Embedding {
                vec: self.vectorize(&text),
                document: text,
            })
            .collect())
    }
}

/// LLM con guion: emite los fragmentos dados o falla, y guarda los prompts.
pub struct ScriptedModel {
    fragments: Vec<String>,
    error: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn answering(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            error: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Emite los fragmentos y después falla.
    pub fn failing_after(fragments: &[&str], error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::answering(fragments)
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnswerModel for ScriptedModel {
    async fn stream_answer(&self, prompt: &str, fragments: mpsc::Sender<String>) -> Result<()> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        for fragment in &self.fragments {
            if fragments.send(fragment.clone()).await.is_err() {
                return Ok(());
            }
        }
        match &self.error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}

/// Fábrica que exige clave como la real y devuelve siempre el mismo modelo.
pub struct ScriptedFactory {
    pub model: Arc<ScriptedModel>,
}

impl ScriptedFactory {
    pub fn new(model: ScriptedModel) -> Self {
        Self {
            model: Arc::new(model),
        }
    }
}

impl AnswerModelFactory for ScriptedFactory {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn connect(&self, api_key: Option<&str>) -> Result<Arc<dyn AnswerModel>> {
        match api_key {
            Some(key) if !key.trim().is_empty() => Ok(self.model.clone()),
            _ => Err(anyhow!("Falta la clave de API de OpenRouter")),
        }
    }
}

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::{
    config::AppConfig,
    llm::{AnswerModelFactory, Embedder, OpenRouterFactory, RigEmbedder},
    session::SessionStore,
    vector_store::IndexBuilder,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub sessions: SessionStore,
    pub index_builder: IndexBuilder,
    pub llm_factory: Arc<dyn AnswerModelFactory>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    /// Estado con los servicios reales (Rig) descritos por la configuración.
    pub fn from_config(config: AppConfig, shutdown_sender: oneshot::Sender<()>) -> Self {
        let embedder: Arc<dyn Embedder> = Arc::new(RigEmbedder::from_config(&config));
        let llm_factory = Arc::new(OpenRouterFactory::from_config(&config));
        Self::with_services(config, embedder, llm_factory, Some(shutdown_sender))
    }

    pub fn with_services(
        config: AppConfig,
        embedder: Arc<dyn Embedder>,
        llm_factory: Arc<dyn AnswerModelFactory>,
        shutdown_sender: Option<oneshot::Sender<()>>,
    ) -> Self {
        let index_builder =
            IndexBuilder::new(embedder, config.chunk_max_chars, config.embed_batch_size);
        Self {
            config,
            sessions: SessionStore::default(),
            index_builder,
            llm_factory,
            shutdown_sender: Arc::new(Mutex::new(shutdown_sender)),
        }
    }
}

//! Motor de consulta RAG sobre el índice en memoria de un fichero.
//!
//! Flujo:
//!   1. Embedding de la pregunta con el mismo modelo que el índice.
//!   2. Recuperación de los top-K chunks más similares.
//!   3. Interpolación de `{context_str}` y `{query_str}` en la plantilla fija.
//!   4. El LLM responde en streaming por el canal de fragmentos.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use crate::{
    llm::{AnswerModel, Embedder},
    vector_store::{ScoredChunk, VectorIndex},
};

/// Respuesta centinela que el prompt pide cuando el contexto no basta.
/// Es un contrato blando: la salida del LLM no se valida.
pub const UNKNOWN_ANSWER: &str = "I don't know!";

const QA_TEMPLATE: &str = "Context information is below.\n\
---------------------\n\
{context_str}\n\
---------------------\n\
Given the context information above, think step by step to answer the query in a highly precise and crisp manner focused on the final answer. If unsure, say 'I don't know!'.\n\
Query: {query_str}\n\
Answer: ";

/// Plantilla con los huecos `{context_str}` y `{query_str}`.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn qa() -> Self {
        Self {
            template: QA_TEMPLATE.to_string(),
        }
    }

    /// La pregunta se sustituye al final para que un `{context_str}` dentro
    /// de ella no se expanda.
    pub fn format(&self, context_str: &str, query_str: &str) -> String {
        let (before, after) = self
            .template
            .split_once("{query_str}")
            .unwrap_or((self.template.as_str(), ""));
        format!(
            "{}{}{}",
            before.replace("{context_str}", context_str),
            query_str,
            after.replace("{context_str}", context_str)
        )
    }
}

/// Índice + plantilla + top-K. Sin estado entre consultas.
pub struct QueryEngine {
    index: VectorIndex,
    template: PromptTemplate,
    top_k: usize,
    embedder: Arc<dyn Embedder>,
}

impl QueryEngine {
    pub fn new(
        index: VectorIndex,
        template: PromptTemplate,
        top_k: usize,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            index,
            template,
            top_k,
            embedder,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.index.len()
    }

    /// Chunks más relevantes para la pregunta.
    pub async fn retrieve(&self, question: &str) -> Result<Vec<ScoredChunk>> {
        let embeddings = self
            .embedder
            .embed_texts(vec![question.to_string()])
            .await
            .context("No se pudo generar el embedding de la consulta")?;
        let query = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No se pudo generar el embedding de la consulta"))?;
        self.index.search(&query, self.top_k)
    }

    /// Prompt completo para la pregunta.
    pub async fn build_prompt(&self, question: &str) -> Result<String> {
        let hits = self.retrieve(question).await?;
        let context = hits
            .iter()
            .map(|hit| hit.chunk.content_for_llm())
            .collect::<Vec<_>>()
            .join("\n\n");
        info!(
            "Consulta con {} chunk(s) de contexto (mejor similitud {:.3})",
            hits.len(),
            hits.first().map(|h| h.score).unwrap_or_default()
        );
        Ok(self.template.format(&context, question))
    }

    /// Recupera contexto y deja que el LLM emita la respuesta por `fragments`.
    /// El canal se cierra al terminar (bien o con error).
    pub async fn query(
        &self,
        question: &str,
        llm: &dyn AnswerModel,
        fragments: mpsc::Sender<String>,
    ) -> Result<()> {
        let prompt = self.build_prompt(question).await?;
        llm.stream_answer(&prompt, fragments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::Document,
        testing::{FakeEmbedder, ScriptedModel},
        vector_store::IndexBuilder,
    };

    async fn engine(docs: &[Document], top_k: usize) -> QueryEngine {
        let embedder: Arc<dyn Embedder> = Arc::new(FakeEmbedder::new(64));
        let index = IndexBuilder::new(embedder.clone(), 4000, 8)
            .build(docs)
            .await
            .unwrap();
        QueryEngine::new(index, PromptTemplate::qa(), top_k, embedder)
    }

    async fn collect(engine: &QueryEngine, question: &str, llm: &ScriptedModel) -> Result<String> {
        let (tx, mut rx) = mpsc::channel(8);
        let (result, answer) = tokio::join!(engine.query(question, llm, tx), async {
            let mut answer = String::new();
            while let Some(fragment) = rx.recv().await {
                answer.push_str(&fragment);
            }
            answer
        });
        result.map(|_| answer)
    }

    #[test]
    fn qa_template_interpolates_context_and_query() {
        let prompt = PromptTemplate::qa().format("CTX", "Q?");
        assert!(prompt.starts_with("Context information is below.\n---------------------\nCTX\n"));
        assert!(prompt.contains(UNKNOWN_ANSWER));
        assert!(prompt.ends_with("Query: Q?\nAnswer: "));
    }

    #[test]
    fn query_text_is_not_expanded() {
        let prompt = PromptTemplate::qa().format("CTX", "what is {context_str}?");
        assert!(prompt.contains("Query: what is {context_str}?"));
    }

    #[tokio::test]
    async fn widgets_question_streams_the_answer() {
        let docs = vec![Document::new("product,qty\nWidget,5\nGadget,3\n")];
        let engine = engine(&docs, 2).await;
        let llm = ScriptedModel::answering(&["The answer", " is ", "5"]);

        let answer = collect(&engine, "How many Widgets were sold?", &llm).await.unwrap();
        assert_eq!(answer, "The answer is 5");

        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Widget,5"));
        assert!(prompts[0].contains("Query: How many Widgets were sold?"));
    }

    #[tokio::test]
    async fn retrieval_returns_the_closest_section() {
        let docs = vec![Document::new(
            "# Fruit\napples pears plums\n# Tools\nhammer wrench saw\n# Colors\nred green blue",
        )];
        let engine = engine(&docs, 1).await;
        let hits = engine.retrieve("which hammer and saw").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].chunk.text.contains("hammer"));
    }

    #[tokio::test]
    async fn irrelevant_questions_still_carry_the_sentinel_instruction() {
        let engine = engine(&[Document::new("product,qty\nWidget,5")], 2).await;
        let llm = ScriptedModel::answering(&[UNKNOWN_ANSWER]);

        let answer = collect(&engine, "Who won the 1998 World Cup?", &llm).await.unwrap();
        assert_eq!(answer, UNKNOWN_ANSWER);
        assert!(llm.prompts()[0].contains("If unsure, say 'I don't know!'."));
    }

    #[tokio::test]
    async fn llm_failures_propagate() {
        let engine = engine(&[Document::new("a,b\n1,2")], 2).await;
        let llm = ScriptedModel::failing_after(&["par"], "401 Unauthorized");
        let err = collect(&engine, "q", &llm).await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}

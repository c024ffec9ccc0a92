//! Índice vectorial en memoria sobre los chunks de un fichero.
//!
//! API pública:
//!   - `IndexBuilder::build(&[Document])` trocea, embebe y construye el índice.
//!   - `VectorIndex::search(&Embedding, usize)` devuelve los top-K chunks.
//!
//! El índice es inmutable una vez construido y nunca se persiste.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use rig::embeddings::{distance::VectorDistance, Embedding};
use tracing::{debug, info};

use crate::{
    chunker,
    llm::Embedder,
    models::{Chunk, Document},
};

/// Chunk con su vector.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub embedding: Embedding,
}

/// Resultado de una búsqueda: similitud coseno + chunk.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub score: f64,
    pub chunk: Chunk,
}

#[derive(Debug)]
pub struct VectorIndex {
    entries: Vec<IndexedChunk>,
    dimensions: usize,
}

impl VectorIndex {
    /// Todos los vectores deben compartir dimensión.
    pub fn new(entries: Vec<IndexedChunk>) -> Result<Self> {
        let dimensions = entries
            .first()
            .map(|e| e.embedding.vec.len())
            .ok_or_else(|| anyhow!("No hay chunks que indexar"))?;
        if dimensions == 0 {
            return Err(anyhow!("El modelo devolvió embeddings vacíos"));
        }
        if let Some(bad) = entries.iter().find(|e| e.embedding.vec.len() != dimensions) {
            return Err(anyhow!(
                "Dimensión inconsistente en el chunk {}: {} en lugar de {}",
                bad.chunk.index,
                bad.embedding.vec.len(),
                dimensions
            ));
        }
        Ok(Self { entries, dimensions })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Los `top_k` chunks más similares; a igual puntuación gana el orden del documento.
    pub fn search(&self, query: &Embedding, top_k: usize) -> Result<Vec<ScoredChunk>> {
        if query.vec.len() != self.dimensions {
            return Err(anyhow!(
                "El embedding de la consulta tiene dimensión {} y el índice {}",
                query.vec.len(),
                self.dimensions
            ));
        }

        let mut scored: Vec<ScoredChunk> = self
            .entries
            .iter()
            .map(|e| ScoredChunk {
                score: e.embedding.cosine_similarity(query, false),
                chunk: e.chunk.clone(),
            })
            .collect();

        // Un vector de norma cero da NaN: se manda al final.
        for hit in &mut scored {
            if hit.score.is_nan() {
                hit.score = f64::NEG_INFINITY;
            }
        }
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.index.cmp(&b.chunk.index))
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// Construye índices con el modelo de embeddings configurado.
#[derive(Clone)]
pub struct IndexBuilder {
    embedder: Arc<dyn Embedder>,
    chunk_max_chars: usize,
    batch_size: usize,
}

impl IndexBuilder {
    pub fn new(embedder: Arc<dyn Embedder>, chunk_max_chars: usize, batch_size: usize) -> Self {
        Self {
            embedder,
            chunk_max_chars,
            batch_size: batch_size.max(1),
        }
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.embedder.clone()
    }

    /// Cualquier fallo aborta la construcción completa: no hay índices parciales.
    pub async fn build(&self, docs: &[Document]) -> Result<VectorIndex> {
        if docs.is_empty() {
            return Err(anyhow!("No hay documentos que indexar"));
        }
        let chunks = chunker::split_documents(docs, self.chunk_max_chars);
        if chunks.is_empty() {
            return Err(anyhow!("Los documentos no contienen texto"));
        }
        info!(
            "Embebiendo {} chunks con '{}'...",
            chunks.len(),
            self.embedder.model_name()
        );

        let mut entries = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(Chunk::content_for_llm).collect();
            let embeddings = self.embedder.embed_texts(texts).await?;
            if embeddings.len() != batch.len() {
                return Err(anyhow!(
                    "Número de embeddings ({}) distinto al número de chunks ({})",
                    embeddings.len(),
                    batch.len()
                ));
            }
            entries.extend(batch.iter().cloned().zip(embeddings).map(|(chunk, embedding)| {
                IndexedChunk { chunk, embedding }
            }));
            debug!("Lote embebido: {}/{}", entries.len(), chunks.len());
        }

        let index = VectorIndex::new(entries)?;
        info!(
            "Índice listo: {} chunks de dimensión {}.",
            index.len(),
            index.dimensions()
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEmbedder;

    fn embedding(vec: Vec<f64>) -> Embedding {
        Embedding {
            document: String::new(),
            vec,
        }
    }

    fn entry(index: usize, vec: Vec<f64>) -> IndexedChunk {
        IndexedChunk {
            chunk: Chunk {
                index,
                text: format!("chunk {index}"),
                metadata: Default::default(),
            },
            embedding: embedding(vec),
        }
    }

    #[test]
    fn search_ranks_by_cosine_similarity() {
        let index = VectorIndex::new(vec![
            entry(0, vec![0.0, 1.0]),
            entry(1, vec![1.0, 0.0]),
            entry(2, vec![0.7, 0.7]),
        ])
        .unwrap();

        let hits = index.search(&embedding(vec![1.0, 0.1]), 2).unwrap();
        let order: Vec<usize> = hits.iter().map(|h| h.chunk.index).collect();
        assert_eq!(order, vec![1, 2]);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn ties_keep_document_order() {
        let index = VectorIndex::new(vec![entry(0, vec![1.0, 0.0]), entry(1, vec![1.0, 0.0])]).unwrap();
        let hits = index.search(&embedding(vec![1.0, 0.0]), 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.index, 0);
    }

    #[test]
    fn zero_vectors_rank_last() {
        let index = VectorIndex::new(vec![
            entry(0, vec![0.0, 0.0]),
            entry(1, vec![0.0, 1.0]),
            entry(2, vec![1.0, 0.0]),
            entry(3, vec![0.0, 0.0]),
        ])
        .unwrap();

        let hits = index.search(&embedding(vec![1.0, 0.0]), 4).unwrap();
        let order: Vec<usize> = hits.iter().map(|h| h.chunk.index).collect();
        assert_eq!(order, vec![2, 1, 0, 3]);
        assert!(hits.iter().all(|h| !h.score.is_nan()));
    }

    #[test]
    fn mixed_dimensions_are_rejected() {
        assert!(VectorIndex::new(vec![entry(0, vec![1.0]), entry(1, vec![1.0, 0.0])]).is_err());
        assert!(VectorIndex::new(Vec::new()).is_err());

        let index = VectorIndex::new(vec![entry(0, vec![1.0, 0.0])]).unwrap();
        assert!(index.search(&embedding(vec![1.0]), 1).is_err());
    }

    #[tokio::test]
    async fn builder_embeds_in_batches() {
        let embedder = Arc::new(FakeEmbedder::new(16));
        let builder = IndexBuilder::new(embedder.clone(), 4000, 2);
        let docs = vec![Document::new("# A\nuno\n# B\ndos\n# C\ntres")];

        let index = builder.build(&docs).await.unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.dimensions(), 16);
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn embedding_failure_aborts_the_build() {
        let embedder = Arc::new(FakeEmbedder::failing(16));
        let builder = IndexBuilder::new(embedder, 4000, 8);
        assert!(builder.build(&[Document::new("texto")]).await.is_err());
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let builder = IndexBuilder::new(Arc::new(FakeEmbedder::new(8)), 4000, 8);
        assert!(builder.build(&[]).await.is_err());
        assert!(builder.build(&[Document::new("   \n")]).await.is_err());
    }
}

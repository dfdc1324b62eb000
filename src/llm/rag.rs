use log::{debug, info};
use serde_json::json;
use std::sync::Arc;

use super::error::ServiceError;
use crate::database::{
    CursorPage, CursorQuery, Document, DocumentChunk, DocumentId, DocumentRepository, NewChunk,
    NewDocument, ScoredChunk,
};
use crate::document::Chunker;
use crate::providers::traits::EmbeddingProvider;

/// Chunk → embed → store on the write path, embed → nearest chunks on the read path.
pub struct RagService {
    repository: Arc<dyn DocumentRepository>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    embedding_dimensions: usize,
    top_k: usize,
}

impl RagService {
    pub fn new(
        repository: Arc<dyn DocumentRepository>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: Chunker,
        embedding_dimensions: usize,
        top_k: usize,
    ) -> Self {
        Self {
            repository,
            embedder,
            chunker,
            embedding_dimensions,
            top_k,
        }
    }

    pub async fn insert_document(&self, content: &str) -> Result<DocumentId, ServiceError> {
        validate_content(content)?;

        let document = self.build_document(content).await?;
        let chunk_count = document.chunks.len();
        let id = self.repository.save_document(document).await?;

        info!("Stored document {} with {} chunks", id, chunk_count);
        Ok(id)
    }

    pub async fn update_document(&self, id: DocumentId, content: &str) -> Result<(), ServiceError> {
        validate_content(content)?;

        // Checked up front so a bad id costs no embedding call.
        if self.repository.get_document(id).await?.is_none() {
            return Err(ServiceError::NotFound(id));
        }

        let document = self.build_document(content).await?;
        let chunk_count = document.chunks.len();
        if !self.repository.replace_document(id, document).await? {
            return Err(ServiceError::NotFound(id));
        }

        info!("Replaced document {} with {} chunks", id, chunk_count);
        Ok(())
    }

    pub async fn get_relevant_chunks(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<ScoredChunk>, ServiceError> {
        if query.trim().is_empty() {
            return Err(ServiceError::Validation("query must not be empty".to_string()));
        }
        let top_k = top_k.unwrap_or(self.top_k);

        let vector = self
            .embed(&[query.to_string()])
            .await?
            .pop()
            .ok_or_else(|| ServiceError::Upstream("no embedding returned for query".to_string()))?;

        let chunks = self.repository.get_relevant_chunks(&vector, top_k).await?;
        debug!("Query matched {} chunks (top_k={})", chunks.len(), top_k);
        Ok(chunks)
    }

    pub async fn get_document(&self, id: DocumentId) -> Result<Document, ServiceError> {
        self.repository
            .get_document(id)
            .await?
            .ok_or(ServiceError::NotFound(id))
    }

    pub async fn document_chunks(&self, id: DocumentId) -> Result<Vec<DocumentChunk>, ServiceError> {
        if self.repository.get_document(id).await?.is_none() {
            return Err(ServiceError::NotFound(id));
        }
        Ok(self.repository.list_chunks(id).await?)
    }

    pub async fn list_documents(
        &self,
        query: CursorQuery,
    ) -> Result<CursorPage<Document>, ServiceError> {
        Ok(self.repository.list_documents(query).await?)
    }

    /// `false` when there was nothing to delete.
    pub async fn delete_document(&self, id: DocumentId) -> Result<bool, ServiceError> {
        let deleted = self.repository.delete_document(id).await?;
        if deleted {
            info!("Deleted document {}", id);
        }
        Ok(deleted)
    }

    async fn build_document(&self, content: &str) -> Result<NewDocument, ServiceError> {
        let pieces = self.chunker.split_with_offsets(content);
        let texts: Vec<String> = pieces.iter().map(|(_, text)| text.clone()).collect();
        let embeddings = self.embed(&texts).await?;

        let chunks = pieces
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(index, ((offset, chunk), embedding))| NewChunk {
                chunk,
                metadata: Some(json!({ "index": index, "offset": offset }).to_string()),
                embedding,
            })
            .collect();

        Ok(NewDocument {
            content: content.to_string(),
            chunks,
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings = self
            .embedder
            .embed(texts)
            .await
            .map_err(|e| ServiceError::upstream("embedding request failed", e))?;

        if embeddings.len() != texts.len() {
            return Err(ServiceError::Upstream(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        if let Some(bad) = embeddings
            .iter()
            .find(|e| e.len() != self.embedding_dimensions)
        {
            return Err(ServiceError::Upstream(format!(
                "embedding has {} dimensions, expected {}",
                bad.len(),
                self.embedding_dimensions
            )));
        }
        if embeddings.iter().flatten().any(|v| !v.is_finite()) {
            return Err(ServiceError::Upstream(
                "embedding contains non-finite values".to_string(),
            ));
        }

        Ok(embeddings)
    }
}

fn validate_content(content: &str) -> Result<(), ServiceError> {
    if content.trim().is_empty() {
        return Err(ServiceError::Validation("content must not be empty".to_string()));
    }
    Ok(())
}

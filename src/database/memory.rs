//! In-memory document store.
//!
//! Same contract as the SQLite store, with brute-force cosine ranking. Every
//! mutation happens under a single write guard, so readers never see half a write.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::repository::{
    CursorPage, CursorQuery, Document, DocumentChunk, DocumentId, DocumentRepository, NewChunk,
    NewDocument, RepositoryError, ScoredChunk,
};
use super::vector::{cosine_distance, VectorError};

struct StoredChunk {
    chunk: DocumentChunk,
    embedding: Vec<f32>,
}

#[derive(Default)]
struct State {
    next_document_id: DocumentId,
    next_chunk_id: i64,
    documents: BTreeMap<DocumentId, Document>,
    chunks: BTreeMap<i64, StoredChunk>,
}

impl State {
    fn insert_chunks(&mut self, document_id: DocumentId, chunks: Vec<NewChunk>) {
        for new_chunk in chunks {
            self.next_chunk_id += 1;
            let id = self.next_chunk_id;
            self.chunks.insert(
                id,
                StoredChunk {
                    chunk: DocumentChunk {
                        id,
                        document_id,
                        chunk: new_chunk.chunk,
                        metadata: new_chunk.metadata,
                    },
                    embedding: new_chunk.embedding,
                },
            );
        }
    }

    fn remove_chunks(&mut self, document_id: DocumentId) {
        self.chunks
            .retain(|_, stored| stored.chunk.document_id != document_id);
    }
}

#[derive(Default)]
pub struct InMemoryDocumentRepository {
    state: RwLock<State>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn save_document(&self, document: NewDocument) -> Result<DocumentId, RepositoryError> {
        let now = Utc::now();
        let mut state = self.state.write();

        state.next_document_id += 1;
        let id = state.next_document_id;
        state.documents.insert(
            id,
            Document {
                id,
                content: document.content,
                created_at: now,
                updated_at: now,
            },
        );
        state.insert_chunks(id, document.chunks);

        Ok(id)
    }

    async fn replace_document(
        &self,
        id: DocumentId,
        document: NewDocument,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write();

        match state.documents.get_mut(&id) {
            Some(existing) => {
                existing.content = document.content;
                existing.updated_at = Utc::now();
            }
            None => return Ok(false),
        }

        state.remove_chunks(id);
        state.insert_chunks(id, document.chunks);
        Ok(true)
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, RepositoryError> {
        Ok(self.state.read().documents.get(&id).cloned())
    }

    async fn get_relevant_chunks(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RepositoryError> {
        let state = self.state.read();

        let mut scored = state
            .chunks
            .values()
            .map(|stored| {
                let distance = cosine_distance(&stored.embedding, query).map_err(|e| match e {
                    VectorError::DimensionMismatch(expected, actual) => {
                        RepositoryError::DimensionMismatch { expected, actual }
                    }
                    other => RepositoryError::Decode(other.to_string()),
                })?;
                Ok(ScoredChunk {
                    chunk: stored.chunk.clone(),
                    distance,
                })
            })
            .collect::<Result<Vec<_>, RepositoryError>>()?;

        // Chunks come out of the map in id order, and the sort is stable.
        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete_document(&self, id: DocumentId) -> Result<bool, RepositoryError> {
        let mut state = self.state.write();
        if state.documents.remove(&id).is_none() {
            return Ok(false);
        }
        state.remove_chunks(id);
        Ok(true)
    }

    async fn list_documents(
        &self,
        query: CursorQuery,
    ) -> Result<CursorPage<Document>, RepositoryError> {
        let page_size = query.page_size();
        let upper = query.last_id().unwrap_or(DocumentId::MAX);

        let state = self.state.read();
        let rows: Vec<Document> = state
            .documents
            .range(..upper)
            .rev()
            .take(page_size + 1)
            .map(|(_, doc)| doc.clone())
            .collect();

        Ok(CursorPage::from_overfetch(rows, page_size, |doc| doc.id))
    }

    async fn list_chunks(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<DocumentChunk>, RepositoryError> {
        Ok(self
            .state
            .read()
            .chunks
            .values()
            .filter(|stored| stored.chunk.document_id == document_id)
            .map(|stored| stored.chunk.clone())
            .collect())
    }
}

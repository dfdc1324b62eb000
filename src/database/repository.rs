use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub type DocumentId = i64;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("Database connection error: {0}")]
    Connection(String),
    #[error("Row decode error: {0}")]
    Decode(String),
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: DocumentId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored chunk as returned to readers. Embeddings stay inside the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunk {
    pub id: i64,
    pub document_id: DocumentId,
    pub chunk: String,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub chunk: DocumentChunk,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk: String,
    pub metadata: Option<String>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub content: String,
    pub chunks: Vec<NewChunk>,
}

#[derive(Debug, Clone, Default)]
pub struct CursorQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

impl CursorQuery {
    pub fn page_size(&self) -> usize {
        match self.limit {
            Some(limit) => limit.clamp(1, MAX_PAGE_SIZE as i64) as usize,
            None => DEFAULT_PAGE_SIZE,
        }
    }

    /// Id of the last item the caller has seen. Anything unusable restarts from the newest.
    pub fn last_id(&self) -> Option<DocumentId> {
        self.cursor
            .as_deref()
            .map(str::trim)
            .and_then(|cursor| cursor.parse::<DocumentId>().ok())
            .filter(|id| *id > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPage<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> CursorPage<T> {
    /// Builds a page from up to `page_size + 1` rows ordered newest first.
    pub fn from_overfetch(mut rows: Vec<T>, page_size: usize, id_of: impl Fn(&T) -> DocumentId) -> Self {
        let has_more = rows.len() > page_size;
        rows.truncate(page_size);

        let next_cursor = if has_more {
            rows.last().map(|item| id_of(item).to_string())
        } else {
            None
        };

        Self {
            items: rows,
            next_cursor,
        }
    }
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Stores the document and all its chunks atomically, returning the new id.
    async fn save_document(&self, document: NewDocument) -> Result<DocumentId, RepositoryError>;

    /// Swaps content and the full chunk set in one step. `false` when the id is unknown.
    async fn replace_document(
        &self,
        id: DocumentId,
        document: NewDocument,
    ) -> Result<bool, RepositoryError>;

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, RepositoryError>;

    /// Nearest chunks by cosine distance, closest first, ties by chunk id.
    async fn get_relevant_chunks(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RepositoryError>;

    async fn delete_document(&self, id: DocumentId) -> Result<bool, RepositoryError>;

    async fn list_documents(
        &self,
        query: CursorQuery,
    ) -> Result<CursorPage<Document>, RepositoryError>;

    async fn list_chunks(&self, document_id: DocumentId)
        -> Result<Vec<DocumentChunk>, RepositoryError>;
}

pub mod memory;
pub mod repository;
pub mod sqlite;
pub mod vector;

pub use memory::InMemoryDocumentRepository;
pub use repository::{
    CursorPage, CursorQuery, Document, DocumentChunk, DocumentId, DocumentRepository, NewChunk,
    NewDocument, RepositoryError, ScoredChunk, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
pub use sqlite::SqliteDocumentRepository;

pub mod api;
pub mod config;
pub mod database;
pub mod document;
pub mod llm;
pub mod providers;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use config::AppConfig;
pub use database::{DocumentRepository, InMemoryDocumentRepository, SqliteDocumentRepository};
pub use document::Chunker;
pub use llm::{ChatService, RagService};

pub mod chat;
pub mod error;
pub mod rag;

pub use chat::ChatService;
pub use error::ServiceError;
pub use rag::RagService;

pub mod openai;
pub mod traits;

pub use openai::OpenAIProvider;
pub use traits::{ChatMessage, ChatProvider, ChatRole, ChatStream, EmbeddingProvider};

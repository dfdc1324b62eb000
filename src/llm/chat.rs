use log::debug;
use std::sync::Arc;

use super::error::ServiceError;
use super::rag::RagService;
use crate::database::ScoredChunk;
use crate::providers::traits::{ChatMessage, ChatProvider, ChatRole, ChatStream};

/// Grounds a conversation in stored documents before handing it to the chat model.
pub struct ChatService {
    rag: Arc<RagService>,
    provider: Arc<dyn ChatProvider>,
    system_prompt: String,
}

impl ChatService {
    pub fn new(rag: Arc<RagService>, provider: Arc<dyn ChatProvider>, system_prompt: String) -> Self {
        Self {
            rag,
            provider,
            system_prompt,
        }
    }

    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<ChatMessage, ServiceError> {
        let conversation = self.ground(messages).await?;

        let reply = self
            .provider
            .complete(&conversation)
            .await
            .map_err(|e| ServiceError::upstream("chat completion failed", e))?;

        Ok(ChatMessage::new(ChatRole::Assistant, reply))
    }

    /// Same grounding as [`ChatService::chat`], but the reply arrives as a stream of deltas.
    /// Errors before the first delta are returned here; later ones arrive in the stream.
    pub async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<ChatStream, ServiceError> {
        let conversation = self.ground(messages).await?;

        self.provider
            .complete_stream(&conversation)
            .await
            .map_err(|e| ServiceError::upstream("chat stream failed", e))
    }

    async fn ground(&self, messages: Vec<ChatMessage>) -> Result<Vec<ChatMessage>, ServiceError> {
        if messages.is_empty() {
            return Err(ServiceError::Validation("messages must not be empty".to_string()));
        }

        // Only the latest user turn is searched; a blank one means no retrieval.
        let latest_question = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .filter(|m| !m.content.trim().is_empty());

        let context = match latest_question {
            Some(question) => self.rag.get_relevant_chunks(&question.content, None).await?,
            None => Vec::new(),
        };
        debug!("Chat grounded with {} chunks", context.len());

        let mut conversation = Vec::with_capacity(messages.len() + 1);
        conversation.push(ChatMessage::new(
            ChatRole::System,
            self.build_system_message(&context),
        ));
        conversation.extend(messages);
        Ok(conversation)
    }

    fn build_system_message(&self, context: &[ScoredChunk]) -> String {
        if context.is_empty() {
            return self.system_prompt.clone();
        }

        let mut message = format!("{}\n\nContext:\n", self.system_prompt);
        for (i, scored) in context.iter().enumerate() {
            message.push_str(&format!("[{}] {}\n", i + 1, scored.chunk.chunk));
        }
        message
    }
}

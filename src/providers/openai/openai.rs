use anyhow::{anyhow, Result};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs,
        EmbeddingInput,
    },
    Client,
};
use async_trait::async_trait;
use futures::StreamExt;

use crate::config::OpenAISettings;
use crate::providers::traits::{ChatMessage, ChatProvider, ChatRole, ChatStream, EmbeddingProvider};

#[derive(Clone)]
pub struct OpenAIProvider {
    client: Client<OpenAIConfig>,
    chat_model: String,
    embedding_model: String,
}

impl OpenAIProvider {
    pub fn new(settings: &OpenAISettings) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(settings.api_key.clone());
        if let Some(api_base) = &settings.api_base {
            config = config.with_api_base(api_base.clone());
        }

        Self {
            client: Client::with_config(config),
            chat_model: settings.chat_model.clone(),
            embedding_model: settings.embedding_model.clone(),
        }
    }

    fn chat_request(&self, messages: &[ChatMessage]) -> Result<CreateChatCompletionRequest> {
        let messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>>>()?;

        Ok(CreateChatCompletionRequestArgs::default()
            .model(&self.chat_model)
            .messages(messages)
            .build()?)
    }
}

fn to_request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage> {
    let content = message.content.clone();
    let request = match message.role {
        ChatRole::System => ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()?,
        ),
        ChatRole::User => ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()?,
        ),
        ChatRole::Assistant => ChatCompletionRequestMessage::Assistant(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(content)
                .build()?,
        ),
    };
    Ok(request)
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.embedding_model)
            .input(EmbeddingInput::StringArray(texts.to_vec()))
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        let mut data = response.data;
        if data.len() != texts.len() {
            return Err(anyhow!(
                "Embedding API returned {} vectors for {} inputs",
                data.len(),
                texts.len()
            ));
        }
        data.sort_by_key(|embedding| embedding.index);

        Ok(data.into_iter().map(|embedding| embedding.embedding).collect())
    }

    fn model(&self) -> &str {
        &self.embedding_model
    }
}

#[async_trait]
impl ChatProvider for OpenAIProvider {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let request = self.chat_request(messages)?;
        let response = self.client.chat().create(request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| anyhow!("No response content"))
    }

    async fn complete_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream> {
        let request = self.chat_request(messages)?;
        let stream = self.client.chat().create_stream(request).await?;

        // Role-only and finish chunks carry no content and are skipped.
        Ok(stream
            .filter_map(|item| async move {
                match item {
                    Ok(response) => response
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content)
                        .map(Ok),
                    Err(e) => Some(Err(anyhow!(e))),
                }
            })
            .boxed())
    }

    fn model(&self) -> &str {
        &self.chat_model
    }
}

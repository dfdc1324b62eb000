//! Deterministic stand-ins for the external model APIs.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::providers::traits::{ChatMessage, ChatProvider, ChatStream, EmbeddingProvider};

pub const DIMENSIONS: usize = 26;

/// Letter-frequency vector, so texts sharing letters land close together.
pub fn letter_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; DIMENSIONS];
    for c in text.chars().map(|c| c.to_ascii_lowercase()) {
        if c.is_ascii_lowercase() {
            vector[(c as u8 - b'a') as usize] += 1.0;
        }
    }
    vector
}

#[derive(Default)]
pub struct FakeEmbedder {
    calls: AtomicUsize,
    fail: bool,
    non_finite: bool,
}

impl FakeEmbedder {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Puts a NaN in the first component of every vector.
    pub fn non_finite() -> Self {
        Self {
            non_finite: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("embedding service unavailable"));
        }
        Ok(texts
            .iter()
            .map(|t| {
                let mut vector = letter_embedding(t);
                if self.non_finite {
                    vector[0] = f32::NAN;
                }
                vector
            })
            .collect())
    }

    fn model(&self) -> &str {
        "fake-embedding"
    }
}

#[derive(Default)]
pub struct FakeChat {
    received: Mutex<Vec<ChatMessage>>,
    fail: bool,
    break_stream: bool,
}

impl FakeChat {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Streams the first word of the reply, then errors.
    pub fn breaking_stream() -> Self {
        Self {
            break_stream: true,
            ..Default::default()
        }
    }

    /// Conversation passed to the most recent call.
    pub fn received(&self) -> Vec<ChatMessage> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl ChatProvider for FakeChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        *self.received.lock() = messages.to_vec();
        if self.fail {
            return Err(anyhow!("chat service unavailable"));
        }
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        Ok(format!("echo: {}", last))
    }

    /// Streams the `complete` reply word by word.
    async fn complete_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream> {
        let reply = self.complete(messages).await?;
        let mut deltas: Vec<Result<String>> = reply
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect();
        if self.break_stream {
            deltas.truncate(1);
            deltas.push(Err(anyhow!("connection reset")));
        }
        Ok(stream::iter(deltas).boxed())
    }

    fn model(&self) -> &str {
        "fake-chat"
    }
}

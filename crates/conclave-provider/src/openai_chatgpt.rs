//! Thin alias over [`OpenAiProvider`] pointed at the default api.openai.com
//! chat-completions endpoint, kept as its own type so provider configs can
//! name "openai" distinctly from an OpenAI-compatible third party without
//! the registry losing type identity.

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;
use std::pin::Pin;

use crate::{LlmProvider, LlmRequest, LlmResponse, OpenAiProvider, StreamChunk};

#[derive(Debug, Clone)]
pub struct OpenAiChatGptProvider {
    inner: OpenAiProvider,
}

impl OpenAiChatGptProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            inner: OpenAiProvider::new(api_key, "https://api.openai.com/v1"),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiChatGptProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.inner.chat(request).await
    }

    async fn stream(
        &self,
        request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        self.inner.stream(request).await
    }

    async fn health(&self) -> Result<()> {
        self.inner.health().await
    }
}

//! Mock provider for local runs and tests.

use super::{
    FinishReason, GenerationParams, ProviderError, ProviderResponse, ProviderStream, StreamChunk,
    TextProvider,
};
use crate::models::ChatTurn;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

/// Failure a mock provider can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Timeout,
    Network,
    Api,
    RateLimited,
    Empty,
    NotConfigured,
}

impl MockFailure {
    fn to_error(self) -> ProviderError {
        match self {
            MockFailure::Timeout => ProviderError::Timeout("mock request timed out".to_string()),
            MockFailure::Network => ProviderError::NetworkError("mock connection refused".to_string()),
            MockFailure::Api => ProviderError::ApiError("mock upstream error".to_string()),
            MockFailure::RateLimited => ProviderError::RateLimited,
            MockFailure::Empty => ProviderError::EmptyResponse,
            MockFailure::NotConfigured => {
                ProviderError::NotConfigured("Mock text provider not enabled".to_string())
            }
        }
    }
}

/// What the mock answers with.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// `Mock response for: <prompt>`.
    Echo,
    /// Always the same text.
    Fixed(String),
    /// Always fail.
    Fail(MockFailure),
    /// Stream `text`, then fail. Non-streaming calls fail outright.
    FailMidStream { text: String, failure: MockFailure },
}

/// A request the mock has seen.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub history: Vec<ChatTurn>,
    pub prompt: String,
}

/// Mock text provider for testing.
pub struct MockTextProvider {
    behavior: MockBehavior,
    latency: Duration,
    stream_chunk_size: usize,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTextProvider {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            latency: Duration::ZERO,
            stream_chunk_size: 8,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn echo() -> Self {
        Self::new(MockBehavior::Echo)
    }

    pub fn fixed(text: impl Into<String>) -> Self {
        Self::new(MockBehavior::Fixed(text.into()))
    }

    pub fn failing(failure: MockFailure) -> Self {
        Self::new(MockBehavior::Fail(failure))
    }

    pub fn failing_mid_stream(text: impl Into<String>, failure: MockFailure) -> Self {
        Self::new(MockBehavior::FailMidStream {
            text: text.into(),
            failure,
        })
    }

    /// Simulated upstream latency per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn record(&self, history: &[ChatTurn], prompt: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                history: history.to_vec(),
                prompt: prompt.to_string(),
            });
        }
    }

    fn reply(&self, prompt: &str) -> Result<String, ProviderError> {
        match &self.behavior {
            MockBehavior::Echo => Ok(format!("Mock response for: {}", prompt)),
            MockBehavior::Fixed(text) => Ok(text.clone()),
            MockBehavior::Fail(failure) | MockBehavior::FailMidStream { failure, .. } => {
                Err(failure.to_error())
            }
        }
    }

    fn text_chunks(&self, text: &str) -> Vec<Result<StreamChunk, ProviderError>> {
        let characters: Vec<char> = text.chars().collect();
        characters
            .chunks(self.stream_chunk_size)
            .map(|chunk| Ok(StreamChunk::Text(chunk.iter().collect())))
            .collect()
    }
}

#[async_trait]
impl TextProvider for MockTextProvider {
    async fn generate(
        &self,
        history: &[ChatTurn],
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<ProviderResponse, ProviderError> {
        self.record(history, prompt);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let text = self.reply(prompt)?;

        Ok(ProviderResponse {
            input_tokens: prompt.len() as i32 / 4,
            output_tokens: text.len() as i32 / 4,
            text,
            finish_reason: FinishReason::Complete,
        })
    }

    async fn generate_stream(
        &self,
        history: &[ChatTurn],
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<ProviderStream, ProviderError> {
        self.record(history, prompt);

        if let MockBehavior::FailMidStream { text, failure } = &self.behavior {
            let mut chunks = self.text_chunks(text);
            chunks.push(Err(failure.to_error()));
            return Ok(Box::pin(tokio_stream::iter(chunks)));
        }

        let text = self.reply(prompt)?;
        let input_tokens = prompt.len() as i32 / 4;
        let output_tokens = text.len() as i32 / 4;

        let mut chunks = self.text_chunks(&text);
        chunks.push(Ok(StreamChunk::Complete {
            input_tokens,
            output_tokens,
            finish_reason: FinishReason::Complete,
        }));

        Ok(Box::pin(tokio_stream::iter(chunks)))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        match &self.behavior {
            MockBehavior::Fail(failure) => Err(failure.to_error()),
            _ => Ok(()),
        }
    }
}

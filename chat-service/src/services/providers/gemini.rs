//! Gemini AI provider implementation.
//!
//! Implements text generation using Google's Gemini API.
//! Supports both streaming and non-streaming responses.

use super::{
    FinishReason, GenerationParams, ProviderError, ProviderResponse, ProviderStream, StreamChunk,
    TextProvider,
};
use crate::models::ChatTurn;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Gemini API base URL.
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini provider configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            api_base: GEMINI_API_BASE.to_string(),
            timeout,
        }
    }
}

/// Gemini text provider.
pub struct GeminiTextProvider {
    config: GeminiConfig,
    client: Client,
}

impl GeminiTextProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Build the API URL for the given model and method.
    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/models/{}:{}?key={}",
            self.config.api_base, self.config.model, method, self.config.api_key
        )
    }

    fn build_request(
        &self,
        history: &[ChatTurn],
        prompt: &str,
        params: &GenerationParams,
    ) -> GenerateContentRequest {
        let mut contents: Vec<Content> = history
            .iter()
            .map(|turn| Content {
                role: Some(turn.role.as_str().to_string()),
                parts: vec![ContentPart::Text {
                    text: turn.content.clone(),
                }],
            })
            .collect();
        contents.push(Content {
            role: Some("user".to_string()),
            parts: vec![ContentPart::Text {
                text: prompt.to_string(),
            }],
        });

        GenerateContentRequest {
            contents,
            system_instruction: params.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![ContentPart::Text { text: text.clone() }],
            }),
            generation_config: Some(build_generation_config(params)),
        }
    }

    async fn post(
        &self,
        url: &str,
        request: &GenerateContentRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self.client.post(url).json(request).send().await?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();

        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }
        if status.as_u16() == 400 {
            return Err(ProviderError::InvalidRequest(api_error_message(&error_text)));
        }

        Err(ProviderError::ApiError(format!(
            "Gemini API error {}: {}",
            status,
            api_error_message(&error_text)
        )))
    }
}

/// Build generation config from parameters.
fn build_generation_config(params: &GenerationParams) -> GenerationConfig {
    GenerationConfig {
        temperature: params.temperature,
        top_p: params.top_p,
        top_k: params.top_k,
        max_output_tokens: params.max_tokens,
        response_mime_type: params.response_mime_type.clone(),
    }
}

/// Pull `error.message` out of a Gemini error body, falling back to the raw text.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.to_string())
}

/// Concatenate the text parts of the first candidate.
fn candidate_text(response: &GenerateContentResponse) -> Option<String> {
    let candidate = response.candidates.first()?;
    let content = candidate.content.as_ref()?;
    let text: String = content
        .parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            ContentPart::InlineData { .. } => None,
        })
        .collect();

    Some(text)
}

fn finish_reason(response: &GenerateContentResponse) -> FinishReason {
    response
        .candidates
        .first()
        .map(|c| FinishReason::from_api(c.finish_reason.as_deref()))
        .unwrap_or(FinishReason::Complete)
}

fn blocked(response: &GenerateContentResponse) -> bool {
    response
        .prompt_feedback
        .as_ref()
        .is_some_and(|f| f.block_reason.is_some())
}

/// Parse a complete response body.
fn parse_response(api_response: GenerateContentResponse) -> Result<ProviderResponse, ProviderError> {
    if blocked(&api_response) {
        return Err(ProviderError::ContentFiltered);
    }

    let finish_reason = finish_reason(&api_response);
    if finish_reason == FinishReason::ContentFilter {
        return Err(ProviderError::ContentFiltered);
    }

    let text = candidate_text(&api_response)
        .filter(|t| !t.is_empty())
        .ok_or(ProviderError::EmptyResponse)?;

    let usage = api_response.usage_metadata.unwrap_or_default();

    Ok(ProviderResponse {
        text,
        input_tokens: usage.prompt_token_count.unwrap_or(0),
        output_tokens: usage.candidates_token_count.unwrap_or(0),
        finish_reason,
    })
}

/// Split complete SSE events off the front of `buffer` and return their `data:` payloads.
///
/// The buffer holds raw bytes so a UTF-8 sequence split across network chunks
/// is only decoded once its event is complete.
fn drain_sse_events(buffer: &mut Vec<u8>) -> Vec<String> {
    // Bare CRs only appear in line endings; JSON escapes them inside payloads.
    buffer.retain(|&b| b != b'\r');

    let mut events = Vec::new();
    while let Some(event_end) = buffer.windows(2).position(|w| w == b"\n\n") {
        let raw: Vec<u8> = buffer.drain(..event_end + 2).collect();
        let event = String::from_utf8_lossy(&raw);
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim_start)
            .collect();
        if !data.is_empty() {
            events.push(data.join("\n"));
        }
    }
    events
}

#[async_trait]
impl TextProvider for GeminiTextProvider {
    async fn generate(
        &self,
        history: &[ChatTurn],
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ProviderResponse, ProviderError> {
        let request = self.build_request(history, prompt, params);
        let url = self.api_url("generateContent");

        tracing::debug!(
            model = %self.config.model,
            prompt_len = prompt.len(),
            history_len = history.len(),
            "Sending request to Gemini API"
        );

        let response = self.post(&url, &request).await?;
        let api_response: GenerateContentResponse = response.json().await?;

        parse_response(api_response)
    }

    async fn generate_stream(
        &self,
        history: &[ChatTurn],
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ProviderStream, ProviderError> {
        let request = self.build_request(history, prompt, params);
        let url = format!("{}&alt=sse", self.api_url("streamGenerateContent"));

        tracing::debug!(
            model = %self.config.model,
            prompt_len = prompt.len(),
            history_len = history.len(),
            "Starting streaming request to Gemini API"
        );

        let response = self.post(&url, &request).await?;

        // Create channel for streaming
        let (tx, rx) = mpsc::channel(32);

        // Spawn task to process SSE stream
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut total_input_tokens = 0i32;
            let mut total_output_tokens = 0i32;
            let mut last_finish_reason = FinishReason::Complete;

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::from(e))).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                for data in drain_sse_events(&mut buffer) {
                    let Ok(response) = serde_json::from_str::<GenerateContentResponse>(&data)
                    else {
                        tracing::warn!("Skipping unparseable Gemini stream event");
                        continue;
                    };

                    if blocked(&response) {
                        let _ = tx.send(Err(ProviderError::ContentFiltered)).await;
                        return;
                    }

                    if let Some(usage) = &response.usage_metadata {
                        total_input_tokens = usage.prompt_token_count.unwrap_or(0);
                        total_output_tokens = usage.candidates_token_count.unwrap_or(0);
                    }

                    if let Some(text) = candidate_text(&response).filter(|t| !t.is_empty()) {
                        if tx.send(Ok(StreamChunk::Text(text))).await.is_err() {
                            // Receiver dropped.
                            return;
                        }
                    }

                    if let Some(candidate) = response.candidates.first() {
                        if candidate.finish_reason.is_some() {
                            last_finish_reason =
                                FinishReason::from_api(candidate.finish_reason.as_deref());
                        }
                    }
                }
            }

            if last_finish_reason == FinishReason::ContentFilter {
                let _ = tx.send(Err(ProviderError::ContentFiltered)).await;
                return;
            }

            let _ = tx
                .send(Ok(StreamChunk::Complete {
                    input_tokens: total_input_tokens,
                    output_tokens: total_output_tokens,
                    finish_reason: last_finish_reason,
                }))
                .await;
        });

        let stream = ReceiverStream::new(rx);
        Ok(Box::pin(stream) as ProviderStream)
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured(
                "Gemini API key not configured".to_string(),
            ));
        }

        // Try to fetch the configured model to verify the key and model name
        let url = format!(
            "{}/models/{}?key={}",
            self.config.api_base, self.config.model, self.config.api_key
        );

        let response = self.client.get(&url).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::ApiError(format!(
                "Health check failed: {}",
                response.status()
            )))
        }
    }
}

// ============================================================================
// Gemini API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum ContentPart {
    Text { text: String },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<i32>,
    candidates_token_count: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

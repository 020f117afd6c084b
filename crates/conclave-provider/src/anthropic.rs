use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_core::Stream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::StreamExt;

use crate::{LlmProvider, LlmRequest, LlmResponse, StreamChunk};

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderErrorKind {
    RateLimit,
    ServerError,
    Timeout,
    AuthError,
    InvalidRequest,
    Unknown,
}

impl ProviderErrorKind {
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::RateLimit,
            401 | 403 => Self::AuthError,
            400 | 422 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ServerError | Self::Timeout)
    }
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn to_api_request(request: LlmRequest) -> ApiRequest {
        let tools: Vec<ApiToolDef> = request
            .tools
            .into_iter()
            .map(|t| ApiToolDef {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect();
        let tool_choice = request.tool_choice.map(ApiToolChoice::from);

        ApiRequest {
            model: request.model,
            system: request.system,
            max_tokens: request.max_tokens,
            tool_choice,
            messages: request
                .messages
                .into_iter()
                .map(|m| {
                    let has_non_text = m
                        .content
                        .iter()
                        .any(|b| !matches!(b, crate::ContentBlock::Text { .. }));
                    if has_non_text {
                        // Send as array for tool_use/tool_result messages
                        let blocks: Vec<serde_json::Value> = m
                            .content
                            .iter()
                            .map(|b| match b {
                                crate::ContentBlock::Text { text } => {
                                    serde_json::json!({"type": "text", "text": text})
                                }
                                crate::ContentBlock::ToolUse { id, name, input } => {
                                    serde_json::json!({"type": "tool_use", "id": id, "name": name, "input": input})
                                }
                                crate::ContentBlock::ToolResult {
                                    tool_use_id,
                                    content,
                                    is_error,
                                } => {
                                    serde_json::json!({"type": "tool_result", "tool_use_id": tool_use_id, "content": content, "is_error": is_error})
                                }
                            })
                            .collect();
                        ApiMessage {
                            role: m.role,
                            content: serde_json::Value::Array(blocks),
                        }
                    } else {
                        let text = m.text();
                        ApiMessage {
                            role: m.role,
                            content: serde_json::Value::String(text),
                        }
                    }
                })
                .collect(),
            tools: if tools.is_empty() { None } else { Some(tools) },
            stream: false,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/v1/messages", self.api_base);
        let payload = Self::to_api_request(request);

        let mut req = self
            .client
            .post(url)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&payload);
        req = req.header("x-api-key", &self.api_key);

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow::anyhow!(
                    "anthropic api error (timeout) [retryable]: request timed out after 60s"
                ));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow::anyhow!(
                    "anthropic api error (connect) [retryable]: {e}"
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            let parsed = serde_json::from_str::<ApiError>(&text).ok();
            return Err(format_api_error(status, parsed));
        }

        let body: ApiResponse = resp.json().await?;
        let content_blocks: Vec<crate::ContentBlock> = body
            .content
            .iter()
            .filter_map(|block| match block.block_type.as_str() {
                "text" => block
                    .text
                    .as_ref()
                    .map(|t| crate::ContentBlock::Text { text: t.clone() }),
                "tool_use" => {
                    let id = block.id.as_ref()?.clone();
                    let name = block.name.as_ref()?.clone();
                    let input = block
                        .input
                        .clone()
                        .unwrap_or(serde_json::Value::Object(Default::default()));
                    Some(crate::ContentBlock::ToolUse { id, name, input })
                }
                _ => None,
            })
            .collect();
        let text = body
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(LlmResponse {
            text,
            content: content_blocks,
            input_tokens: body.usage.as_ref().map(|u| u.input_tokens),
            output_tokens: body.usage.as_ref().map(|u| u.output_tokens),
            stop_reason: body.stop_reason,
        })
    }

    async fn stream(
        &self,
        request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let url = format!("{}/v1/messages", self.api_base);
        let mut payload = Self::to_api_request(request);
        payload.stream = true;

        let mut req = self
            .client
            .post(url)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&payload);
        req = req.header("x-api-key", &self.api_key);

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow::anyhow!(
                    "anthropic api error (timeout) [retryable]: request timed out after 60s"
                ));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow::anyhow!(
                    "anthropic api error (connect) [retryable]: {e}"
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            let parsed = serde_json::from_str::<ApiError>(&text).ok();
            return Err(format_api_error(status, parsed));
        }

        let sse_stream = parse_sse_stream(resp.bytes_stream());
        Ok(Box::pin(sse_stream))
    }
}

fn parse_sse_stream(
    byte_stream: impl Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> impl Stream<Item = Result<StreamChunk>> + Send {
    async_stream::stream! {
        tokio::pin!(byte_stream);
        let mut buffer = String::new();

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    while let Some(pos) = buffer.find("\n\n") {
                        let event_text = buffer[..pos].to_string();
                        buffer = buffer[pos + 2..].to_string();

                        for line in event_text.lines() {
                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };

                            if data == "[DONE]" {
                                continue;
                            }

                            match serde_json::from_str::<serde_json::Value>(data) {
                                Ok(event) => {
                                    if let Some(chunk) = parse_sse_event(&event) {
                                        yield Ok(chunk);
                                    }
                                }
                                Err(e) => {
                                    yield Err(anyhow!("invalid sse event payload: {e}"));
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(anyhow!("stream error: {e}"));
                    return;
                }
            }
        }
    }
}

fn parse_sse_event(event: &serde_json::Value) -> Option<StreamChunk> {
    let event_type = event.get("type")?.as_str()?;

    match event_type {
        "content_block_delta" => {
            let delta = event.get("delta")?;
            let text = delta.get("text")?.as_str()?.to_string();
            Some(StreamChunk {
                delta: text,
                is_final: false,
                input_tokens: None,
                output_tokens: None,
                stop_reason: None,
                content_blocks: vec![],
            })
        }
        "message_delta" => {
            let delta = event.get("delta")?;
            let stop_reason = delta
                .get("stop_reason")
                .and_then(|value| value.as_str())
                .map(std::string::ToString::to_string);
            let usage = event.get("usage");
            let output_tokens = usage
                .and_then(|u| u.get("output_tokens"))
                .and_then(|value| value.as_u64())
                .and_then(|value| u32::try_from(value).ok());

            Some(StreamChunk {
                delta: String::new(),
                is_final: true,
                input_tokens: None,
                output_tokens,
                stop_reason,
                content_blocks: vec![],
            })
        }
        "message_start" => {
            let message = event.get("message")?;
            let usage = message.get("usage")?;
            let input_tokens = usage
                .get("input_tokens")
                .and_then(|value| value.as_u64())
                .and_then(|value| u32::try_from(value).ok());

            Some(StreamChunk {
                delta: String::new(),
                is_final: false,
                input_tokens,
                output_tokens: None,
                stop_reason: None,
                content_blocks: vec![],
            })
        }
        _ => None,
    }
}

fn format_api_error(status: StatusCode, parsed: Option<ApiError>) -> anyhow::Error {
    let kind = ProviderErrorKind::from_status(status);
    let retryable = if kind.is_retryable() {
        " [retryable]"
    } else {
        ""
    };
    if let Some(api_error) = parsed {
        let detail = api_error.error;
        anyhow!(
            "anthropic api error ({status}){retryable}: {} ({})",
            detail.message,
            detail.r#type
        )
    } else {
        anyhow!("anthropic api error ({status}){retryable}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: u32,
    pub messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ApiToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ApiToolChoice>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

/// Anthropic's `tool_choice`: `{"type": "auto"}` / `{"type": "any"}` /
/// `{"type": "tool", "name": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ApiToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

impl From<crate::ToolChoice> for ApiToolChoice {
    fn from(choice: crate::ToolChoice) -> Self {
        match choice {
            crate::ToolChoice::Auto => Self::Auto,
            crate::ToolChoice::Required => Self::Any,
            crate::ToolChoice::Named(name) => Self::Tool { name },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiMessage {
    pub role: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiResponse {
    pub content: Vec<ApiContentBlock>,
    pub usage: Option<ApiUsage>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiErrorDetail {
    #[serde(rename = "type")]
    pub r#type: String,
    pub message: String,
}

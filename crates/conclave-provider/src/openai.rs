//! OpenAI chat-completions provider.
//!
//! https://platform.openai.com/docs/api-reference/chat

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_core::Stream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::StreamExt;

use crate::{ContentBlock, LlmProvider, LlmRequest, LlmResponse, StreamChunk};

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub(crate) fn to_api_request(request: &LlmRequest, stream: bool) -> ApiRequest {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ApiMessage {
                role: "system".into(),
                content: Some(system.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        for m in &request.messages {
            let mut tool_calls = Vec::new();
            let mut text_parts = Vec::new();
            let mut tool_result: Option<(&str, &str)> = None;
            for block in &m.content {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text.clone()),
                    ContentBlock::ToolUse { id, name, input } => tool_calls.push(ApiToolCall {
                        id: id.clone(),
                        r#type: "function".into(),
                        function: ApiToolCallFn {
                            name: name.clone(),
                            arguments: input.to_string(),
                        },
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => tool_result = Some((tool_use_id, content)),
                }
            }
            if let Some((tool_use_id, content)) = tool_result {
                messages.push(ApiMessage {
                    role: "tool".into(),
                    content: Some(content.to_string()),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.to_string()),
                });
                continue;
            }
            messages.push(ApiMessage {
                role: m.role.clone(),
                content: if text_parts.is_empty() {
                    None
                } else {
                    Some(text_parts.join("\n"))
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            });
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| ApiToolDef {
                        r#type: "function".into(),
                        function: ApiFunctionDef {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };

        ApiRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            tools,
            tool_choice: request.tool_choice.clone().map(api_tool_choice),
            stream,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let payload = Self::to_api_request(&request, false);

        let resp = match self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow!(
                    "openai api error (timeout) [retryable]: request timed out after 120s"
                ));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow!("openai api error (connect) [retryable]: {e}"));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            return Err(format_api_error(status, &text));
        }

        let body: ApiResponse = resp.json().await?;
        to_llm_response(body)
    }

    async fn stream(
        &self,
        request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let url = format!("{}/chat/completions", self.api_base);
        let payload = Self::to_api_request(&request, true);

        let resp = match self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow!(
                    "openai api error (timeout) [retryable]: request timed out after 120s"
                ));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow!("openai api error (connect) [retryable]: {e}"));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            return Err(format_api_error(status, &text));
        }

        let sse_stream = parse_sse_stream(resp.bytes_stream());
        Ok(Box::pin(sse_stream))
    }
}

fn to_llm_response(body: ApiResponse) -> Result<LlmResponse> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("openai response carried no choices"))?;
    let mut content = Vec::new();
    if let Some(text) = &choice.message.content {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text: text.clone() });
        }
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        let input = serde_json::from_str(&call.function.arguments)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        content.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }
    let text = choice.message.content.clone().unwrap_or_default();
    Ok(LlmResponse {
        text,
        content,
        input_tokens: body.usage.as_ref().map(|u| u.prompt_tokens),
        output_tokens: body.usage.as_ref().map(|u| u.completion_tokens),
        stop_reason: choice.finish_reason,
    })
}

fn format_api_error(status: StatusCode, body: &str) -> anyhow::Error {
    let retryable = matches!(status.as_u16(), 429 | 500..=599);
    let parsed: Option<ApiError> = serde_json::from_str(body).ok();
    let message = parsed
        .map(|e| e.error.message)
        .unwrap_or_else(|| body.to_string());
    if retryable {
        anyhow!("openai api error ({status}) [retryable]: {message}")
    } else {
        anyhow!("openai api error ({status}): {message}")
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
                                yield Ok(StreamChunk {
                                    delta: String::new(),
                                    is_final: true,
                                    input_tokens: None,
                                    output_tokens: None,
                                    stop_reason: Some("stop".into()),
                                    content_blocks: vec![],
                                });
                                continue;
                            }
                            let Ok(parsed) = serde_json::from_str::<ApiStreamChunk>(data) else {
                                continue;
                            };
                            let Some(choice) = parsed.choices.into_iter().next() else {
                                continue;
                            };
                            let delta = choice.delta.content.unwrap_or_default();
                            if !delta.is_empty() {
                                yield Ok(StreamChunk {
                                    delta,
                                    is_final: false,
                                    input_tokens: None,
                                    output_tokens: None,
                                    stop_reason: None,
                                    content_blocks: vec![],
                                });
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

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    stream: bool,
}

/// OpenAI's `tool_choice`: the bare strings `"auto"`/`"required"`, or
/// `{"type": "function", "function": {"name": "..."}}` to force one tool.
fn api_tool_choice(choice: crate::ToolChoice) -> serde_json::Value {
    match choice {
        crate::ToolChoice::Auto => serde_json::Value::String("auto".into()),
        crate::ToolChoice::Required => serde_json::Value::String("required".into()),
        crate::ToolChoice::Named(name) => serde_json::json!({"type": "function", "function": {"name": name}}),
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiToolCallFn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiToolCallFn {
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ApiToolDef {
    r#type: String,
    function: ApiFunctionDef,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ApiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiChoice {
    message: ApiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiErrorDetail {
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiStreamChunk {
    choices: Vec<ApiStreamChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiStreamChoice {
    delta: ApiStreamDelta,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiStreamDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LlmMessage;

    #[test]
    fn openai_new_trims_trailing_slash() {
        let provider = OpenAiProvider::new("sk-test", "https://api.openai.com/v1/");
        assert_eq!(provider.api_base, "https://api.openai.com/v1");
    }

    #[test]
    fn to_api_request_includes_system_as_first_message() {
        let req = LlmRequest {
            model: "gpt-4o".into(),
            system: Some("be terse".into()),
            messages: vec![LlmMessage::user("hi")],
            max_tokens: 512,
            tools: vec![],
            tool_choice: None,
        };
        let api_req = OpenAiProvider::to_api_request(&req, false);
        assert_eq!(api_req.messages[0].role, "system");
        assert_eq!(api_req.messages[1].role, "user");
    }

    #[test]
    fn to_api_request_splits_tool_result_into_tool_role_message() {
        let req = LlmRequest {
            model: "gpt-4o".into(),
            system: None,
            messages: vec![LlmMessage {
                role: "user".into(),
                content: vec![ContentBlock::ToolResult {
                    tool_use_id: "call_1".into(),
                    content: "42".into(),
                    is_error: false,
                }],
            }],
            max_tokens: 512,
            tools: vec![],
            tool_choice: None,
        };
        let api_req = OpenAiProvider::to_api_request(&req, false);
        assert_eq!(api_req.messages[0].role, "tool");
        assert_eq!(api_req.messages[0].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn to_api_request_maps_named_tool_choice() {
        let req = LlmRequest {
            model: "gpt-4o".into(),
            system: None,
            messages: vec![LlmMessage::user("hi")],
            max_tokens: 512,
            tools: vec![],
            tool_choice: Some(crate::ToolChoice::Named("team_up".into())),
        };
        let api_req = OpenAiProvider::to_api_request(&req, false);
        assert_eq!(
            api_req.tool_choice,
            Some(serde_json::json!({"type": "function", "function": {"name": "team_up"}}))
        );
    }

    #[test]
    fn to_llm_response_extracts_tool_calls() {
        let body = ApiResponse {
            choices: vec![ApiChoice {
                message: ApiResponseMessage {
                    content: None,
                    tool_calls: Some(vec![ApiToolCall {
                        id: "call_1".into(),
                        r#type: "function".into(),
                        function: ApiToolCallFn {
                            name: "search".into(),
                            arguments: "{\"q\":\"rust\"}".into(),
                        },
                    }]),
                },
                finish_reason: Some("tool_calls".into()),
            }],
            usage: None,
        };
        let resp = to_llm_response(body).unwrap();
        assert_eq!(resp.tool_calls().len(), 1);
    }
}

//! Anthropic Messages API adapter
//!
//! The system prompt moves to the top-level `system` field, tool calls are
//! `tool_use` content blocks, and tool results are `tool_result` blocks inside
//! a `user` message. Consecutive tool results share one user message.

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::providers::client::check_status;
use crate::providers::pricing::ANTHROPIC_PRICING;
use crate::providers::{
    ChunkStream, CompletionRequest, CompletionResponse, Credentials, FragmentStream,
    LazyHttpClient, LlmMessage, LlmProvider, LlmRole, LlmToolCall, PricingTable, ProviderError,
    ToolChoice, Usage, VendorConfig, terminated_stream,
};

pub const ANTHROPIC_PROVIDER_NAME: &str = "anthropic";
pub const ANTHROPIC_DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
pub const ANTHROPIC_ENV_VARS: &[&str] = &["ANTHROPIC_API_KEY"];
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    /// Block types this adapter does not consume (thinking, images, ...)
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct AnthropicToolChoice {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    model: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
    #[allow(dead_code)]
    stop_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    ContentBlockDelta { delta: AnthropicDelta },
    MessageStop,
    Error { error: AnthropicErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: String,
}

/// Adapter for the Anthropic Messages API
#[derive(Debug)]
pub struct AnthropicProvider {
    base_url: String,
    default_model: String,
    credentials: Credentials,
    client: LazyHttpClient,
}

impl AnthropicProvider {
    pub fn new(config: &VendorConfig) -> Self {
        Self {
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_MODEL.to_string()),
            credentials: Credentials::new(config.api_key.clone(), ANTHROPIC_ENV_VARS),
            client: LazyHttpClient::new(config.timeout_seconds),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    fn build_request(&self, request: &CompletionRequest, stream: bool) -> AnthropicRequest {
        let tools: Vec<AnthropicTool> = request
            .tools
            .iter()
            .map(|tool| AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.parameters.clone(),
            })
            .collect();

        let tool_choice = (!tools.is_empty()).then(|| AnthropicToolChoice {
            kind: match request.tool_choice {
                ToolChoice::Auto => "auto",
                ToolChoice::None => "none",
                ToolChoice::Required => "any",
            },
        });

        AnthropicRequest {
            model: request.model_or(&self.default_model).to_string(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system_prompt(),
            messages: to_anthropic_messages(&request.messages),
            tools,
            tool_choice,
            stream: stream.then_some(true),
        }
    }

    fn parse_response(&self, response: AnthropicResponse, requested_model: &str) -> CompletionResponse {
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        for block in response.content {
            match block {
                AnthropicBlock::Text { text: part } => text.push_str(&part),
                AnthropicBlock::ToolUse { id, name, input } => {
                    let arguments = match input {
                        Value::Object(map) => map,
                        _ => Map::new(),
                    };
                    tool_calls.push(LlmToolCall::new(id, name, arguments));
                }
                AnthropicBlock::ToolResult { .. } | AnthropicBlock::Other => {}
            }
        }

        CompletionResponse {
            content: (!text.is_empty()).then_some(text),
            tool_calls,
            usage: Usage::new(response.usage.input_tokens, response.usage.output_tokens),
            model: response.model.unwrap_or_else(|| requested_model.to_string()),
            provider: ANTHROPIC_PROVIDER_NAME.to_string(),
        }
    }

    async fn post(&self, body: &AnthropicRequest) -> Result<Response, ProviderError> {
        let api_key = self.credentials.require(ANTHROPIC_PROVIDER_NAME)?;
        let client = self.client.get().await?;

        let url = self.messages_url();
        debug!(url = %url, model = %body.model, stream = body.stream.is_some(), "Making Anthropic API request");

        let response = client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(provider = ANTHROPIC_PROVIDER_NAME, error = %e, "Request failed");
                ProviderError::from_transport(&e, self.client.timeout_seconds())
            })?;

        check_status(ANTHROPIC_PROVIDER_NAME, response).await
    }
}

fn to_anthropic_messages(messages: &[LlmMessage]) -> Vec<AnthropicMessage> {
    let mut out: Vec<AnthropicMessage> = Vec::new();
    let mut merging_tool_results = false;

    for msg in messages {
        match msg.role {
            LlmRole::System => continue,
            LlmRole::Tool => {
                let block = AnthropicBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.clone(),
                };
                match out.last_mut() {
                    Some(last) if merging_tool_results => last.content.push(block),
                    _ => out.push(AnthropicMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
                merging_tool_results = true;
            }
            LlmRole::User | LlmRole::Assistant => {
                let mut content = Vec::new();
                if !msg.content.is_empty() {
                    content.push(AnthropicBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                for call in msg.tool_calls.iter().flatten() {
                    content.push(AnthropicBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: Value::Object(call.arguments.clone()),
                    });
                }
                merging_tool_results = false;

                if content.is_empty() {
                    continue;
                }
                out.push(AnthropicMessage {
                    role: if msg.role == LlmRole::User { "user" } else { "assistant" },
                    content,
                });
            }
        }
    }

    out
}

fn parse_stream_data(data: &str) -> Option<Result<Option<String>, ProviderError>> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }

    match serde_json::from_str::<AnthropicStreamEvent>(data) {
        Ok(AnthropicStreamEvent::ContentBlockDelta {
            delta: AnthropicDelta::TextDelta { text },
        }) => Some(Ok(Some(text))),
        Ok(AnthropicStreamEvent::MessageStop) => Some(Ok(None)),
        Ok(AnthropicStreamEvent::Error { error }) => {
            Some(Err(ProviderError::provider(error.message, error.error_type)))
        }
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "Skipping unparseable Anthropic SSE event");
            None
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        ANTHROPIC_PROVIDER_NAME
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn is_available(&self) -> bool {
        self.credentials.is_resolvable()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let body = self.build_request(request, false);
        info!(
            model = %body.model,
            provider = ANTHROPIC_PROVIDER_NAME,
            message_count = body.messages.len(),
            tool_count = body.tools.len(),
            "Sending completion request"
        );

        let response = self.post(&body).await?;
        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::serialization(format!("Failed to parse response: {}", e)))?;

        let completion = self.parse_response(parsed, &body.model);
        info!(
            model = %completion.model,
            has_tool_calls = completion.has_tool_calls(),
            prompt_tokens = completion.usage.prompt_tokens,
            completion_tokens = completion.usage.completion_tokens,
            "Received completion"
        );

        Ok(completion)
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let body = self.build_request(request, true);
        info!(
            model = %body.model,
            provider = ANTHROPIC_PROVIDER_NAME,
            message_count = body.messages.len(),
            "Opening completion stream"
        );

        let response = self.post(&body).await?;
        let fragments: FragmentStream = Box::pin(response.bytes_stream().eventsource().filter_map(
            |event| async move {
                match event {
                    Ok(event) => parse_stream_data(&event.data),
                    Err(e) => Some(Err(ProviderError::network(format!("Stream interrupted: {}", e)))),
                }
            },
        ));

        Ok(terminated_stream(fragments))
    }

    fn pricing(&self) -> &PricingTable {
        &ANTHROPIC_PRICING
    }
}

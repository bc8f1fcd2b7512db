//! OpenAI Chat Completions adapter
//!
//! Maps the neutral request onto `/chat/completions`:
//!
//! - `system` stays a regular message role
//! - tool results are `tool`-role messages carrying `tool_call_id`
//! - tool-call arguments travel as JSON-encoded strings
//! - streaming uses SSE `data:` lines terminated by `[DONE]`

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::extract::extract_json;
use crate::providers::client::check_status;
use crate::providers::pricing::OPENAI_PRICING;
use crate::providers::{
    ChunkStream, CompletionRequest, CompletionResponse, Credentials, FragmentStream,
    LazyHttpClient, LlmMessage, LlmProvider, LlmRole, LlmToolCall, PricingTable, ProviderError,
    ToolChoice, Usage, VendorConfig, terminated_stream,
};

pub const OPENAI_PROVIDER_NAME: &str = "openai";
pub const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const OPENAI_ENV_VARS: &[&str] = &["OPENAI_API_KEY"];

/// OpenAI API request body format
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

/// OpenAI message format
#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

/// OpenAI tool call format
#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAiToolCall {
    id: String,
    /// Always "function"
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: OpenAiFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

/// Function name plus JSON-encoded arguments
#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Tool schema offered to the model
#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAiFunctionDef,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

/// OpenAI API response format
#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
    model: Option<String>,
    error: Option<OpenAiError>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
}

/// One `data:` payload of a streamed completion
#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

/// Adapter for the OpenAI Chat Completions API
#[derive(Debug)]
pub struct OpenAiProvider {
    base_url: String,
    default_model: String,
    credentials: Credentials,
    client: LazyHttpClient,
}

impl OpenAiProvider {
    /// Creates the adapter from vendor configuration; no network work happens here
    pub fn new(config: &VendorConfig) -> Self {
        Self {
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string()),
            credentials: Credentials::new(config.api_key.clone(), OPENAI_ENV_VARS),
            client: LazyHttpClient::new(config.timeout_seconds),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Builds the OpenAI API request body
    fn build_request(&self, request: &CompletionRequest, stream: bool) -> OpenAiRequest {
        let messages = request.messages.iter().map(to_openai_message).collect();

        let tools: Vec<OpenAiTool> = request
            .tools
            .iter()
            .map(|tool| OpenAiTool {
                kind: "function",
                function: OpenAiFunctionDef {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect();

        let tool_choice = if tools.is_empty() {
            None
        } else {
            Some(match request.tool_choice {
                ToolChoice::Auto => "auto",
                ToolChoice::None => "none",
                ToolChoice::Required => "required",
            })
        };

        OpenAiRequest {
            model: request.model_or(&self.default_model).to_string(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools,
            tool_choice,
            stream: stream.then_some(true),
        }
    }

    /// Parses the OpenAI response into the neutral shape
    fn parse_response(
        &self,
        response: OpenAiResponse,
        requested_model: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        if let Some(error) = response.error {
            return Err(ProviderError::provider(
                error.message,
                error.code.or(error.error_type),
            ));
        }

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::provider("No response choices returned", None::<&str>))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let arguments = parse_tool_arguments(&call.function.name, &call.function.arguments);
                LlmToolCall::new(call.id, call.function.name, arguments)
            })
            .collect();

        let usage = response
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.content.filter(|c| !c.is_empty()),
            tool_calls,
            usage,
            model: response.model.unwrap_or_else(|| requested_model.to_string()),
            provider: OPENAI_PROVIDER_NAME.to_string(),
        })
    }

    async fn post(&self, body: &OpenAiRequest) -> Result<Response, ProviderError> {
        let api_key = self.credentials.require(OPENAI_PROVIDER_NAME)?;
        let client = self.client.get().await?;

        let url = self.completions_url();
        debug!(url = %url, model = %body.model, stream = body.stream.is_some(), "Making OpenAI API request");

        let response = client
            .post(&url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(provider = OPENAI_PROVIDER_NAME, error = %e, "Request failed");
                ProviderError::from_transport(&e, self.client.timeout_seconds())
            })?;

        check_status(OPENAI_PROVIDER_NAME, response).await
    }
}

fn to_openai_message(msg: &LlmMessage) -> OpenAiMessage {
    let tool_calls = msg.tool_calls.as_ref().filter(|c| !c.is_empty()).map(|calls| {
        calls
            .iter()
            .map(|call| OpenAiToolCall {
                id: call.id.clone(),
                call_type: function_type(),
                function: OpenAiFunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments_json(),
                },
            })
            .collect()
    });

    // Assistant tool-call messages may carry no text; tool results always do
    let content = if msg.content.is_empty() && msg.role != LlmRole::Tool {
        None
    } else {
        Some(msg.content.clone())
    };

    OpenAiMessage {
        role: msg.role.as_str().to_string(),
        content,
        tool_calls,
        tool_call_id: msg.tool_call_id.clone(),
    }
}

/// Decodes a JSON-encoded argument string, tolerating sloppy model output
fn parse_tool_arguments(tool_name: &str, raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }

    match extract_json::<Map<String, Value>>(raw).into_result() {
        Ok(arguments) => arguments,
        Err(e) => {
            warn!(tool = %tool_name, error = %e, "Unparseable tool arguments, using empty arguments");
            Map::new()
        }
    }
}

/// Maps one SSE `data:` payload to a fragment; `None` skips the event
fn parse_stream_data(data: &str) -> Option<Result<Option<String>, ProviderError>> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(None));
    }

    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .map(|text| Ok(Some(text))),
        Err(e) => {
            debug!(error = %e, "Skipping unparseable SSE chunk");
            None
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        OPENAI_PROVIDER_NAME
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
            provider = OPENAI_PROVIDER_NAME,
            message_count = body.messages.len(),
            tool_count = body.tools.len(),
            "Sending completion request"
        );

        let response = self.post(&body).await?;
        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::serialization(format!("Failed to parse response: {}", e)))?;

        let completion = self.parse_response(parsed, &body.model)?;
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
            provider = OPENAI_PROVIDER_NAME,
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
        &OPENAI_PRICING
    }
}

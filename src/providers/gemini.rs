//! Google Gemini `generateContent` adapter
//!
//! The system prompt becomes `systemInstruction`, the assistant role is
//! `model`, and tools travel as `functionCall` / `functionResponse` parts.
//! Gemini issues no call ids, so the adapter assigns `call_<n>` in response
//! order and maps results back to function names by walking the transcript.

use std::collections::HashMap;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info};

use crate::providers::client::check_status;
use crate::providers::pricing::GEMINI_PRICING;
use crate::providers::{
    ChunkStream, CompletionRequest, CompletionResponse, Credentials, FragmentStream,
    LazyHttpClient, LlmMessage, LlmProvider, LlmRole, LlmToolCall, PricingTable, ProviderError,
    ToolChoice, Usage, VendorConfig, terminated_stream,
};

pub const GEMINI_PROVIDER_NAME: &str = "gemini";
pub const GEMINI_DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const GEMINI_ENV_VARS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<GeminiToolConfig>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiToolConfig {
    function_calling_config: GeminiFunctionCallingConfig,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionCallingConfig {
    mode: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
    model_version: Option<String>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiContent,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
    status: Option<String>,
}

/// Adapter for the Gemini API
#[derive(Debug)]
pub struct GeminiProvider {
    base_url: String,
    default_model: String,
    credentials: Credentials,
    client: LazyHttpClient,
}

impl GeminiProvider {
    pub fn new(config: &VendorConfig) -> Self {
        Self {
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| GEMINI_DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| GEMINI_DEFAULT_MODEL.to_string()),
            credentials: Credentials::new(config.api_key.clone(), GEMINI_ENV_VARS),
            client: LazyHttpClient::new(config.timeout_seconds),
        }
    }

    fn generate_url(&self, model: &str, stream: bool) -> String {
        if stream {
            format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url, model)
        } else {
            format!("{}/models/{}:generateContent", self.base_url, model)
        }
    }

    fn build_request(&self, request: &CompletionRequest) -> GeminiRequest {
        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![GeminiTool {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|tool| GeminiFunctionDeclaration {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        let tool_config = (!tools.is_empty()).then(|| GeminiToolConfig {
            function_calling_config: GeminiFunctionCallingConfig {
                mode: match request.tool_choice {
                    ToolChoice::Auto => "AUTO",
                    ToolChoice::None => "NONE",
                    ToolChoice::Required => "ANY",
                },
            },
        });

        GeminiRequest {
            contents: to_gemini_contents(&request.messages),
            system_instruction: request.system_prompt().map(|text| GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: Some(text),
                    ..Default::default()
                }],
            }),
            tools,
            tool_config,
            generation_config: GeminiGenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        }
    }

    fn parse_response(
        &self,
        response: GeminiResponse,
        requested_model: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        if let Some(error) = response.error {
            return Err(ProviderError::provider(error.message, error.status));
        }

        let mut text = String::new();
        let mut tool_calls = Vec::new();

        let parts = response
            .candidates
            .into_iter()
            .next()
            .map(|c| c.content.parts)
            .unwrap_or_default();

        for part in parts {
            if let Some(fragment) = part.text {
                text.push_str(&fragment);
            }
            if let Some(call) = part.function_call {
                let arguments = match call.args {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                let id = format!("call_{}", tool_calls.len());
                tool_calls.push(LlmToolCall::new(id, call.name, arguments));
            }
        }

        let usage = response
            .usage_metadata
            .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: (!text.is_empty()).then_some(text),
            tool_calls,
            usage,
            model: response
                .model_version
                .unwrap_or_else(|| requested_model.to_string()),
            provider: GEMINI_PROVIDER_NAME.to_string(),
        })
    }

    async fn post(&self, url: &str, body: &GeminiRequest) -> Result<Response, ProviderError> {
        let api_key = self.credentials.require(GEMINI_PROVIDER_NAME)?;
        let client = self.client.get().await?;

        debug!(url = %url, "Making Gemini API request");

        let response = client
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(provider = GEMINI_PROVIDER_NAME, error = %e, "Request failed");
                ProviderError::from_transport(&e, self.client.timeout_seconds())
            })?;

        check_status(GEMINI_PROVIDER_NAME, response).await
    }
}

fn to_gemini_contents(messages: &[LlmMessage]) -> Vec<GeminiContent> {
    let mut out: Vec<GeminiContent> = Vec::new();
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    let mut merging_responses = false;

    for msg in messages {
        match msg.role {
            LlmRole::System => continue,
            LlmRole::Tool => {
                let id = msg.tool_call_id.as_deref().unwrap_or_default();
                let name = call_names.get(id).copied().unwrap_or(id).to_string();
                let part = GeminiPart {
                    function_response: Some(GeminiFunctionResponse {
                        name,
                        response: function_response_payload(&msg.content),
                    }),
                    ..Default::default()
                };
                match out.last_mut() {
                    Some(last) if merging_responses => last.parts.push(part),
                    _ => out.push(GeminiContent {
                        role: Some("user".to_string()),
                        parts: vec![part],
                    }),
                }
                merging_responses = true;
            }
            LlmRole::User | LlmRole::Assistant => {
                let mut parts = Vec::new();
                if !msg.content.is_empty() {
                    parts.push(GeminiPart {
                        text: Some(msg.content.clone()),
                        ..Default::default()
                    });
                }
                for call in msg.tool_calls.iter().flatten() {
                    call_names.insert(&call.id, &call.name);
                    parts.push(GeminiPart {
                        function_call: Some(GeminiFunctionCall {
                            name: call.name.clone(),
                            args: Value::Object(call.arguments.clone()),
                        }),
                        ..Default::default()
                    });
                }
                merging_responses = false;

                if parts.is_empty() {
                    continue;
                }
                let role = if msg.role == LlmRole::User { "user" } else { "model" };
                out.push(GeminiContent {
                    role: Some(role.to_string()),
                    parts,
                });
            }
        }
    }

    out
}

/// `functionResponse.response` must be an object
fn function_response_payload(content: &str) -> Value {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(other) => json!({ "result": other }),
        Err(_) => json!({ "result": content }),
    }
}

fn parse_stream_data(data: &str) -> Option<Result<Option<String>, ProviderError>> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }

    match serde_json::from_str::<GeminiResponse>(data) {
        Ok(GeminiResponse {
            error: Some(error), ..
        }) => Some(Err(ProviderError::provider(error.message, error.status))),
        Ok(chunk) => {
            let text: String = chunk
                .candidates
                .into_iter()
                .next()
                .map(|c| c.content.parts.into_iter().filter_map(|p| p.text).collect())
                .unwrap_or_default();
            (!text.is_empty()).then(|| Ok(Some(text)))
        }
        Err(e) => {
            debug!(error = %e, "Skipping unparseable Gemini SSE chunk");
            None
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        GEMINI_PROVIDER_NAME
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn is_available(&self) -> bool {
        self.credentials.is_resolvable()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let model = request.model_or(&self.default_model).to_string();
        let body = self.build_request(request);
        info!(
            model = %model,
            provider = GEMINI_PROVIDER_NAME,
            message_count = body.contents.len(),
            tool_count = request.tools.len(),
            "Sending completion request"
        );

        let response = self.post(&self.generate_url(&model, false), &body).await?;
        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::serialization(format!("Failed to parse response: {}", e)))?;

        let completion = self.parse_response(parsed, &model)?;
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
        let model = request.model_or(&self.default_model).to_string();
        let body = self.build_request(request);
        info!(
            model = %model,
            provider = GEMINI_PROVIDER_NAME,
            message_count = body.contents.len(),
            "Opening completion stream"
        );

        let response = self.post(&self.generate_url(&model, true), &body).await?;
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
        &GEMINI_PRICING
    }
}

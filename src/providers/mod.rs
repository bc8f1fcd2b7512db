//! LLM Provider module for stockpilot
//!
//! This module defines the provider contract and the shared request/response
//! model that every vendor adapter translates to and from.
//!
//! # Architecture
//!
//! - `LlmProvider` trait defines the interface all providers implement
//! - Vendor-specific wire shapes live only inside their adapter module
//!   (`openai`, `anthropic`, `gemini`); nothing upstream sees them
//! - `ProviderFactory` creates the appropriate provider from configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use stockpilot::providers::{CompletionRequest, LlmMessage, LlmProvider};
//!
//! async fn example(provider: &dyn LlmProvider) {
//!     let request = CompletionRequest::new(vec![
//!         LlmMessage::system("You are a helpful assistant"),
//!         LlmMessage::user("Hello!"),
//!     ]);
//!
//!     let response = provider.complete(&request).await.unwrap();
//!     println!("Response: {}", response.text());
//! }
//! ```

use std::fmt;
use std::pin::Pin;

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod anthropic;
pub mod client;
pub mod error;
pub mod factory;
pub mod gemini;
#[cfg(test)]
pub mod mock;
pub mod openai;
pub mod pricing;

pub use anthropic::AnthropicProvider;
pub use client::{Credentials, LazyHttpClient};
pub use error::ProviderError;
pub use factory::{ProviderConfig, ProviderFactory, ProviderKind, VendorConfig};
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use pricing::{ModelRate, PricingTable};

/// Default completion budget when a request does not set one
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Represents a message in the transcript sent to a provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmMessage {
    /// Role of the message sender
    pub role: LlmRole,
    /// Content of the message
    pub content: String,
    /// Tool calls requested by the assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<LlmToolCall>>,
    /// Correlation id of the tool call this message answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl LlmMessage {
    /// Creates a new message with the specified role and content
    pub fn new(role: LlmRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LlmRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LlmRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(LlmRole::Assistant, content)
    }

    /// Creates a tool-result message correlated with a tool call id
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(LlmRole::Tool, content).with_tool_call_id(tool_call_id)
    }

    /// Creates a new message with tool calls
    pub fn with_tool_calls(mut self, tool_calls: Vec<LlmToolCall>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    /// Sets the tool call id this message answers
    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    /// Returns true if this message is from the system
    pub fn is_system(&self) -> bool {
        matches!(self.role, LlmRole::System)
    }

    /// Returns true if this message is from a tool
    pub fn is_tool(&self) -> bool {
        matches!(self.role, LlmRole::Tool)
    }

    /// Returns true if this is an assistant message carrying tool calls
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// Role of a message sender in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant response
    Assistant,
    /// Tool result
    Tool,
}

impl LlmRole {
    /// Returns the string representation of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmRole::System => "system",
            LlmRole::User => "user",
            LlmRole::Assistant => "assistant",
            LlmRole::Tool => "tool",
        }
    }
}

impl fmt::Display for LlmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Represents a tool call requested by the model
///
/// Arguments are kept as an untyped JSON map at the boundary; callers pull
/// typed values out with [`LlmToolCall::parse_arguments`] right after receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmToolCall {
    /// Unique identifier for this tool call
    pub id: String,
    /// Name of the tool to execute
    pub name: String,
    /// Arguments for the tool
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl LlmToolCall {
    /// Creates a new tool call
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Deserializes the arguments into a typed value
    pub fn parse_arguments<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.arguments.clone()))
    }

    /// Returns the arguments encoded as a JSON string
    pub fn arguments_json(&self) -> String {
        Value::Object(self.arguments.clone()).to_string()
    }
}

/// Definition of a tool offered to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// Tool description
    pub description: String,
    /// JSON Schema for tool parameters
    pub parameters: Value,
}

impl ToolDefinition {
    /// Creates a new tool definition
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// How the model may use the attached tools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// The model decides whether to call tools
    #[default]
    Auto,
    /// The model must not call tools
    None,
    /// The model must call at least one tool
    Required,
}

/// A provider-neutral completion request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRequest {
    /// Ordered transcript
    pub messages: Vec<LlmMessage>,
    /// Model to use; `None` means the adapter's default model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Maximum completion tokens
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Tool schemas offered to the model
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    /// Tool-choice policy, only sent when tools are attached
    #[serde(default)]
    pub tool_choice: ToolChoice,
}

impl CompletionRequest {
    /// Creates a request with default budget and no tools
    pub fn new(messages: Vec<LlmMessage>) -> Self {
        Self {
            messages,
            model: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Attaches tool schemas with the given choice policy
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>, choice: ToolChoice) -> Self {
        self.tools = tools;
        self.tool_choice = choice;
        self
    }

    /// Returns the model to use, falling back to the given default
    pub fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.model.as_deref() {
            Some(model) if !model.is_empty() => model,
            _ => default,
        }
    }

    /// Returns the system prompt text, joining multiple system messages
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.is_system())
            .map(|m| m.content.as_str())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Adds another usage record to this one
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Response from an LLM provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionResponse {
    /// Text content, absent when the model only called tools
    pub content: Option<String>,
    /// Tool calls in the order the provider returned them
    #[serde(default)]
    pub tool_calls: Vec<LlmToolCall>,
    /// Token usage
    #[serde(default)]
    pub usage: Usage,
    /// Model that served the request
    pub model: String,
    /// Provider that served the request
    pub provider: String,
}

impl CompletionResponse {
    /// Creates a text-only response
    pub fn text_response(
        content: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            usage: Usage::default(),
            model: model.into(),
            provider: provider.into(),
        }
    }

    /// Adds tool calls to the response
    pub fn with_tool_calls(mut self, tool_calls: Vec<LlmToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Adds token usage information
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Returns true if this response contains tool calls
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Returns the text content or an empty string
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// One increment of a streamed completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text fragment, empty on the terminal chunk
    pub content: String,
    /// True only on the final chunk
    pub done: bool,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            content: String::new(),
            done: true,
        }
    }
}

/// Stream of chunks returned by [`LlmProvider::stream`]
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Raw fragments produced by an adapter; `Ok(None)` marks the vendor's end-of-stream
pub(crate) type FragmentStream =
    Pin<Box<dyn Stream<Item = Result<Option<String>, ProviderError>> + Send>>;

/// Turns adapter fragments into a [`ChunkStream`] that skips empty fragments
/// and always ends with exactly one `done` chunk (after an error, nothing follows).
pub(crate) fn terminated_stream(fragments: FragmentStream) -> ChunkStream {
    Box::pin(stream::unfold(Some(fragments), |state| async move {
        let mut fragments = state?;
        loop {
            match fragments.next().await {
                Some(Ok(Some(text))) if text.is_empty() => continue,
                Some(Ok(Some(text))) => return Some((Ok(StreamChunk::text(text)), Some(fragments))),
                Some(Ok(None)) | None => return Some((Ok(StreamChunk::done()), None)),
                Some(Err(e)) => return Some((Err(e), None)),
            }
        }
    }))
}

/// Trait for LLM providers (OpenAI, Anthropic, Gemini, ...)
///
/// All implementations must be Send + Sync to allow concurrent usage across tasks.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns the provider name, used for logging and identification
    fn name(&self) -> &str;

    /// Returns the model used when a request does not name one
    fn default_model(&self) -> &str;

    /// Whether the vendor accepts tool schemas
    fn supports_tools(&self) -> bool {
        true
    }

    /// Whether [`LlmProvider::stream`] yields incremental chunks
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Reports whether credentials resolve. Never touches the network.
    fn is_available(&self) -> bool;

    /// Sends a non-streaming completion request
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Sends a streaming completion request
    ///
    /// The returned stream always ends with one chunk carrying `done = true`.
    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, ProviderError>;

    /// Per-model USD rates for this vendor
    fn pricing(&self) -> &PricingTable;

    /// Estimates the USD cost of a call
    ///
    /// Unknown models are priced with the default model's row.
    fn estimate_cost(&self, prompt_tokens: u32, completion_tokens: u32, model: Option<&str>) -> f64 {
        let model = model.unwrap_or(self.default_model());
        self.pricing()
            .rate_for(model, self.default_model())
            .cost(prompt_tokens, completion_tokens)
    }
}

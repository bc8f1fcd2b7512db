use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::context::{
    DEFAULT_SYSTEM_PROMPT, NoopSessionStore, PromptBuilder, SessionEntry, SessionStore,
    StaticPromptBuilder,
};
use crate::agent::tools::{ToolExecutor, ToolResult};
use crate::providers::{
    CompletionRequest, LlmMessage, LlmProvider, LlmRole, LlmToolCall, ProviderError, ToolChoice, Usage,
};
use crate::ratelimit::{CallGuard, GuardedProvider};

pub const DEFAULT_DECISION_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_NARRATION_MAX_TOKENS: u32 = 512;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_HISTORY_MESSAGES: usize = 20;
pub const DEFAULT_MAX_TOOL_RESULT_CHARS: usize = 8000;

/// Appended to tool results cut at `max_tool_result_chars`
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Errors that can occur during a turn
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("Decision request failed: {0}")]
    Decision(#[source] ProviderError),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Context building failed: {0}")]
    Context(String),
}

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Budgets and defaults for a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Used when the prompt builder fails or returns nothing
    pub system_prompt: String,
    /// Overrides the provider's default model
    pub model: Option<String>,
    pub decision_max_tokens: u32,
    pub narration_max_tokens: u32,
    /// Per provider call
    pub request_timeout_seconds: u64,
    pub max_history_messages: usize,
    pub max_tool_result_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            model: None,
            decision_max_tokens: DEFAULT_DECISION_MAX_TOKENS,
            narration_max_tokens: DEFAULT_NARRATION_MAX_TOKENS,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_history_messages: DEFAULT_MAX_HISTORY_MESSAGES,
            max_tool_result_chars: DEFAULT_MAX_TOOL_RESULT_CHARS,
        }
    }
}

impl AgentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.decision_max_tokens == 0 || self.narration_max_tokens == 0 {
            return Err("max token budgets must be positive".to_string());
        }
        if self.request_timeout_seconds == 0 {
            return Err("request_timeout_seconds must be positive".to_string());
        }
        if self.max_tool_result_chars == 0 {
            return Err("max_tool_result_chars must be positive".to_string());
        }
        Ok(())
    }
}

/// Input of a single turn
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub session_id: String,
    pub message: String,
    /// Prior messages, oldest first
    pub history: Vec<LlmMessage>,
}

impl TurnInput {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<LlmMessage>) -> Self {
        self.history = history;
        self
    }
}

/// Result of a completed turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub message: String,
    pub tool_calls: Vec<LlmToolCall>,
    /// Parallel to `tool_calls`
    pub tool_results: Vec<ToolResult>,
    pub usage: Usage,
    pub model: String,
    pub provider: String,
    /// The narration request failed; `message` is partial or a tool summary
    pub degraded: bool,
}

/// Text of the narration step, and the error that cut it short if any
struct Narration {
    text: String,
    usage: Option<Usage>,
    model: Option<String>,
    failure: Option<ProviderError>,
}

impl Narration {
    fn failed(text: String, error: ProviderError) -> Self {
        Self {
            text,
            usage: None,
            model: None,
            failure: Some(error),
        }
    }
}

/// Runs one user turn: decision, tool execution, narration
pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolExecutor>,
    prompt_builder: Arc<dyn PromptBuilder>,
    session_store: Arc<dyn SessionStore>,
    config: AgentConfig,
}

impl AgentLoop {
    /// Creates a loop with the default prompt and no persistence
    pub fn new(provider: Arc<dyn LlmProvider>, tools: Arc<dyn ToolExecutor>) -> Self {
        let config = AgentConfig::default();
        Self {
            provider,
            tools,
            prompt_builder: Arc::new(StaticPromptBuilder::new(config.system_prompt.clone())),
            session_store: Arc::new(NoopSessionStore),
            config,
        }
    }

    /// Replaces the config; the static prompt follows `config.system_prompt`
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.prompt_builder = Arc::new(StaticPromptBuilder::new(config.system_prompt.clone()));
        self.config = config;
        self
    }

    pub fn with_prompt_builder(mut self, prompt_builder: Arc<dyn PromptBuilder>) -> Self {
        self.prompt_builder = prompt_builder;
        self
    }

    pub fn with_session_store(mut self, session_store: Arc<dyn SessionStore>) -> Self {
        self.session_store = session_store;
        self
    }

    /// Routes every provider call through `guard` as essential traffic
    pub fn with_call_guard(mut self, guard: Arc<CallGuard>) -> Self {
        self.provider = Arc::new(GuardedProvider::new(self.provider, guard).essential(true));
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    /// Runs a turn without history, streaming or external cancellation
    pub async fn process(&self, session_id: &str, message: &str) -> Result<TurnOutcome> {
        self.run_turn(TurnInput::new(session_id, message), None, &CancellationToken::new())
            .await
    }

    /// Runs a full turn
    ///
    /// When `sink` is set, narration fragments are forwarded to it as they
    /// arrive; a turn that needs no tools sends its whole answer as one
    /// fragment. Cancelling `cancel` drops the in-flight call, skips the
    /// remaining tools and persistence, and returns [`AgentError::Cancelled`].
    pub async fn run_turn(
        &self,
        input: TurnInput,
        sink: Option<UnboundedSender<String>>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let TurnInput {
            session_id,
            message,
            history,
        } = input;

        if message.trim().is_empty() {
            return Err(AgentError::Context("user message is empty".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let provider_name = self.provider.name().to_string();
        info!(session_id = %session_id, provider = %provider_name, "Starting turn");

        let mut transcript = self.build_transcript(&session_id, &message, &history).await;

        let tool_definitions = if self.provider.supports_tools() {
            self.tools.tool_definitions()
        } else {
            Vec::new()
        };
        let tools_offered = !tool_definitions.is_empty();
        let mut decision_request = self.request(transcript.clone(), self.config.decision_max_tokens);
        if tools_offered {
            decision_request = decision_request.with_tools(tool_definitions, ToolChoice::Auto);
        }

        debug!(
            session_id = %session_id,
            messages = decision_request.messages.len(),
            tools = decision_request.tools.len(),
            "Awaiting decision"
        );
        let decision = self
            .bounded(cancel, self.provider.complete(&decision_request))
            .await
            .map_err(|e| {
                if e.is_cancelled() {
                    AgentError::Cancelled
                } else {
                    warn!(session_id = %session_id, error = %e, "Decision request failed");
                    AgentError::Decision(e)
                }
            })?;

        let mut usage = decision.usage;

        if !tools_offered && decision.has_tool_calls() {
            warn!(
                session_id = %session_id,
                dropped = decision.tool_calls.len(),
                "Ignoring tool calls returned without any tools offered"
            );
        }

        if !tools_offered || !decision.has_tool_calls() {
            debug!(session_id = %session_id, "No tool calls, answering directly");
            let text = decision.text().to_string();
            if let Some(sink) = &sink {
                if !text.is_empty() {
                    forward(sink, &session_id, text.clone());
                }
            }
            let outcome = TurnOutcome {
                message: text,
                tool_calls: Vec::new(),
                tool_results: Vec::new(),
                usage,
                model: decision.model,
                provider: provider_name,
                degraded: false,
            };
            return self.finish(&session_id, &message, outcome, cancel).await;
        }

        let tool_calls = decision.tool_calls.clone();
        let mut tool_results = Vec::with_capacity(tool_calls.len());
        for call in &tool_calls {
            if cancel.is_cancelled() {
                warn!(session_id = %session_id, tool = %call.name, "Turn cancelled before tool execution");
                return Err(AgentError::Cancelled);
            }
            debug!(session_id = %session_id, tool = %call.name, call_id = %call.id, "Executing tool");
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                result = self.tools.execute_tool(&call.name, &call.arguments) => result,
            };
            if let Some(error) = &result.error {
                warn!(session_id = %session_id, tool = %call.name, error = %error, "Tool reported failure");
            }
            tool_results.push(result);
        }

        transcript.push(LlmMessage::assistant(decision.text()).with_tool_calls(tool_calls.clone()));
        for (call, result) in tool_calls.iter().zip(&tool_results) {
            let content = truncate_chars(result.transcript_content(), self.config.max_tool_result_chars);
            transcript.push(LlmMessage::tool_result(call.id.clone(), content));
        }

        let narration_request = self
            .request(transcript, self.config.narration_max_tokens)
            .with_tools(Vec::new(), ToolChoice::None);

        let narration = match &sink {
            Some(sink) if self.provider.supports_streaming() => {
                debug!(session_id = %session_id, "Streaming narration");
                self.stream_narration(&session_id, &narration_request, sink, cancel).await
            }
            _ => {
                debug!(session_id = %session_id, "Awaiting narration");
                match self.bounded(cancel, self.provider.complete(&narration_request)).await {
                    Ok(response) => Narration {
                        text: response.text().to_string(),
                        usage: Some(response.usage),
                        model: Some(response.model),
                        failure: None,
                    },
                    Err(e) => Narration::failed(String::new(), e),
                }
            }
        };

        if let Some(narration_usage) = &narration.usage {
            usage.accumulate(narration_usage);
        }

        let (message_text, degraded) = match narration.failure {
            None => (narration.text, false),
            Some(e) if e.is_cancelled() => return Err(AgentError::Cancelled),
            Some(e) => {
                warn!(
                    session_id = %session_id,
                    error = %e,
                    streamed_chars = narration.text.len(),
                    "Narration failed, returning degraded answer"
                );
                if narration.text.is_empty() {
                    (summarize_tool_results(&tool_calls, &tool_results), true)
                } else {
                    (narration.text, true)
                }
            }
        };

        let outcome = TurnOutcome {
            message: message_text,
            tool_calls,
            tool_results,
            usage,
            model: narration.model.unwrap_or(decision.model),
            provider: provider_name,
            degraded,
        };
        self.finish(&session_id, &message, outcome, cancel).await
    }

    /// System prompt, then the most recent history, then the user message
    async fn build_transcript(&self, session_id: &str, message: &str, history: &[LlmMessage]) -> Vec<LlmMessage> {
        let system_prompt = match self.prompt_builder.system_prompt(session_id).await {
            Ok(prompt) if !prompt.trim().is_empty() => prompt,
            Ok(_) => self.config.system_prompt.clone(),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Prompt builder failed, using base prompt");
                self.config.system_prompt.clone()
            }
        };

        let kept: Vec<&LlmMessage> = history.iter().filter(|m| !m.is_system()).collect();
        let skip = kept.len().saturating_sub(self.config.max_history_messages);

        let mut transcript = Vec::with_capacity(self.config.max_history_messages + 2);
        transcript.push(LlmMessage::system(system_prompt));
        // A tool result cut off from its assistant call is rejected by vendors
        transcript.extend(
            kept.into_iter()
                .skip(skip)
                .skip_while(|m| m.is_tool())
                .cloned(),
        );
        transcript.push(LlmMessage::user(message));
        transcript
    }

    fn request(&self, messages: Vec<LlmMessage>, max_tokens: u32) -> CompletionRequest {
        let request = CompletionRequest::new(messages).with_max_tokens(max_tokens);
        match &self.config.model {
            Some(model) => request.with_model(model.clone()),
            None => request,
        }
    }

    /// Races a provider call against cancellation and the request timeout
    async fn bounded<T, F>(&self, cancel: &CancellationToken, call: F) -> std::result::Result<T, ProviderError>
    where
        F: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let timeout = self.config.request_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(timeout.as_secs())),
            },
        }
    }

    /// Forwards fragments to `sink` while accumulating them
    ///
    /// The timeout applies to opening the stream and to the wait for each chunk.
    async fn stream_narration(
        &self,
        session_id: &str,
        request: &CompletionRequest,
        sink: &UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> Narration {
        let mut stream = match self.bounded(cancel, self.provider.stream(request)).await {
            Ok(stream) => stream,
            Err(e) => return Narration::failed(String::new(), e),
        };

        let timeout = self.config.request_timeout();
        let mut text = String::new();
        let mut sink_open = true;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Narration::failed(text, ProviderError::Cancelled),
                next = tokio::time::timeout(timeout, stream.next()) => next,
            };

            match next {
                Err(_) => return Narration::failed(text, ProviderError::timeout(timeout.as_secs())),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Narration::failed(text, e),
                Ok(Some(Ok(chunk))) => {
                    if !chunk.content.is_empty() {
                        if sink_open {
                            sink_open = forward(sink, session_id, chunk.content.clone());
                        }
                        text.push_str(&chunk.content);
                    }
                    if chunk.done {
                        break;
                    }
                }
            }
        }

        Narration {
            text,
            usage: None,
            model: None,
            failure: None,
        }
    }

    async fn finish(
        &self,
        session_id: &str,
        user_message: &str,
        outcome: TurnOutcome,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let entries = [
            SessionEntry::new(session_id, LlmRole::User, user_message),
            SessionEntry::new(session_id, LlmRole::Assistant, outcome.message.clone())
                .with_tool_activity(outcome.tool_calls.clone(), outcome.tool_results.clone()),
        ];
        for entry in entries {
            if let Err(e) = self.session_store.record(entry).await {
                warn!(session_id = %session_id, error = %e, "Failed to persist turn");
            }
        }

        info!(
            session_id = %session_id,
            provider = %outcome.provider,
            model = %outcome.model,
            tool_calls = outcome.tool_calls.len(),
            total_tokens = outcome.usage.total_tokens,
            degraded = outcome.degraded,
            "Turn complete"
        );
        Ok(outcome)
    }
}

/// Sends a fragment, returning false once the receiver is gone
fn forward(sink: &UnboundedSender<String>, session_id: &str, fragment: String) -> bool {
    if sink.send(fragment).is_err() {
        debug!(session_id = %session_id, "Chunk receiver dropped, no longer forwarding");
        return false;
    }
    true
}

/// Cuts `text` to at most `max_chars` characters plus the truncation marker
fn truncate_chars(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => {
            let mut truncated = text[..index].to_string();
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        }
        None => text,
    }
}

/// Fallback answer when narration produced nothing
fn summarize_tool_results(calls: &[LlmToolCall], results: &[ToolResult]) -> String {
    let lines: Vec<String> = calls
        .iter()
        .zip(results)
        .map(|(call, result)| match (&result.error, &result.display) {
            (Some(error), _) => format!("- {}: failed ({})", call.name, error),
            (None, Some(display)) => format!("- {}: {}", call.name, display),
            (None, None) => format!("- {}: done", call.name),
        })
        .collect();

    format!(
        "I ran {} tool call(s) but could not write a summary:\n{}",
        calls.len(),
        lines.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::context::InMemorySessionStore;
    use crate::agent::tools::{Tool, ToolError, ToolRegistry};
    use crate::providers::CompletionResponse;
    use crate::providers::mock::{MockLlmProvider, MockProviderBuilder, MockStream};
    use crate::utils::StockpilotError;
    use serde_json::{Map, Value, json};
    use std::sync::Mutex;

    struct AddSymbolTool {
        symbols: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Tool for AddSymbolTool {
        fn name(&self) -> &str {
            "add_symbol"
        }

        fn description(&self) -> &str {
            "Adds a ticker symbol to the watchlist"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "symbol": { "type": "string" } },
                "required": ["symbol"]
            })
        }

        async fn execute(&self, args: &Map<String, Value>) -> std::result::Result<ToolResult, ToolError> {
            let symbol = args
                .get("symbol")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::invalid_arguments("add_symbol", "'symbol' must be a string"))?;
            self.symbols.lock().unwrap().push(symbol.to_string());
            Ok(ToolResult::ok(json!({ "added": symbol })).with_display(format!("added {}", symbol)))
        }
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl SessionStore for FailingStore {
        async fn record(&self, entry: SessionEntry) -> std::result::Result<(), StockpilotError> {
            Err(StockpilotError::session_persistence(entry.session_id, "disk full"))
        }
    }

    struct FailingPromptBuilder;

    #[async_trait::async_trait]
    impl PromptBuilder for FailingPromptBuilder {
        async fn system_prompt(&self, _session_id: &str) -> Result<String> {
            Err(AgentError::Context("profile unavailable".to_string()))
        }
    }

    fn watchlist() -> (Arc<ToolRegistry>, Arc<Mutex<Vec<String>>>) {
        let symbols = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ToolRegistry::new();
        registry
            .register(Box::new(AddSymbolTool {
                symbols: symbols.clone(),
            }))
            .unwrap();
        (Arc::new(registry), symbols)
    }

    fn add_symbol_call(id: &str, symbol: &str) -> LlmToolCall {
        let mut args = Map::new();
        args.insert("symbol".to_string(), json!(symbol));
        LlmToolCall::new(id, "add_symbol", args)
    }

    fn agent(mock: &Arc<MockLlmProvider>) -> AgentLoop {
        let (tools, _) = watchlist();
        AgentLoop::new(mock.clone(), tools)
    }

    #[tokio::test]
    async fn test_no_tools_registered_single_request() {
        let mock = Arc::new(MockProviderBuilder::new().response("Hello there").build());
        let agent = AgentLoop::new(mock.clone(), Arc::new(ToolRegistry::new()));

        let outcome = agent.process("s1", "hi").await.unwrap();

        assert_eq!(outcome.message, "Hello there");
        assert!(outcome.tool_calls.is_empty());
        assert!(!outcome.degraded);
        assert_eq!(outcome.provider, "mock");
        assert_eq!(mock.call_count(), 1);
        assert!(mock.last_request().unwrap().tools.is_empty());
    }

    #[tokio::test]
    async fn test_decision_request_shape() {
        let mock = Arc::new(MockLlmProvider::new());
        let history = vec![LlmMessage::user("earlier"), LlmMessage::assistant("reply")];
        agent(&mock)
            .run_turn(
                TurnInput::new("s1", "what now").with_history(history),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let request = mock.last_request().unwrap();
        assert_eq!(request.max_tokens, DEFAULT_DECISION_MAX_TOKENS);
        assert_eq!(request.tool_choice, ToolChoice::Auto);
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.messages.len(), 4);
        assert!(request.messages[0].is_system());
        assert_eq!(request.messages[3].content, "what now");
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.push_tool_calls(vec![add_symbol_call("call_1", "AAPL")]);
        mock.push_text("AAPL is now on your watchlist.");
        let (tools, symbols) = watchlist();
        let agent = AgentLoop::new(mock.clone(), tools);

        let outcome = agent.process("s1", "watch apple").await.unwrap();

        assert_eq!(outcome.message, "AAPL is now on your watchlist.");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_results.len(), 1);
        assert_eq!(outcome.tool_results[0].result, json!({"added": "AAPL"}));
        assert_eq!(*symbols.lock().unwrap(), vec!["AAPL".to_string()]);
        assert_eq!(mock.call_count(), 2);

        let narration = mock.last_request().unwrap();
        assert!(narration.tools.is_empty());
        assert_eq!(narration.tool_choice, ToolChoice::None);
        assert_eq!(narration.max_tokens, DEFAULT_NARRATION_MAX_TOKENS);

        let tool_messages: Vec<&LlmMessage> = narration.messages.iter().filter(|m| m.is_tool()).collect();
        assert_eq!(tool_messages.len(), 1);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool_messages[0].content, r#"{"added":"AAPL"}"#);

        let assistant = narration.messages.iter().find(|m| m.has_tool_calls()).unwrap();
        assert_eq!(assistant.role, LlmRole::Assistant);
    }

    #[tokio::test]
    async fn test_tool_failure_does_not_abort_turn() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.push_tool_calls(vec![
            LlmToolCall::new("call_1", "add_symbol", Map::new()),
            LlmToolCall::new("call_2", "remove_everything", Map::new()),
        ]);
        mock.push_text("Neither worked.");

        let outcome = agent(&mock).process("s1", "do things").await.unwrap();

        assert_eq!(outcome.message, "Neither worked.");
        assert!(outcome.tool_results.iter().all(ToolResult::is_error));

        let narration = mock.last_request().unwrap();
        let tool_messages: Vec<&LlmMessage> = narration.messages.iter().filter(|m| m.is_tool()).collect();
        assert_eq!(tool_messages.len(), 2);
        assert!(tool_messages[1].content.contains("Tool not found: remove_everything"));
    }

    #[tokio::test]
    async fn test_streamed_narration_forwards_in_order() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.push_tool_calls(vec![add_symbol_call("call_1", "MSFT")]);
        mock.push_stream(MockStream::Chunks(vec!["A".into(), "B".into(), "C".into()]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let outcome = agent(&mock)
            .run_turn(TurnInput::new("s1", "watch msft"), Some(tx), &CancellationToken::new())
            .await
            .unwrap();

        let mut fragments = Vec::new();
        while let Ok(fragment) = rx.try_recv() {
            fragments.push(fragment);
        }
        assert_eq!(fragments, vec!["A", "B", "C"]);
        assert_eq!(outcome.message, "ABC");
        assert!(!outcome.degraded);
        assert_eq!(mock.stream_count(), 1);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_direct_answer_sent_to_sink() {
        let mock = Arc::new(MockProviderBuilder::new().response("Nothing to do").build());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        agent(&mock)
            .run_turn(TurnInput::new("s1", "hello"), Some(tx), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), "Nothing to do");
        assert_eq!(mock.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_failure_after_partial_text_is_degraded() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.push_tool_calls(vec![add_symbol_call("call_1", "NVDA")]);
        mock.push_stream(MockStream::FailAfter(
            vec!["Added ".into(), "NVDA".into()],
            ProviderError::network("connection reset"),
        ));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let outcome = agent(&mock)
            .run_turn(TurnInput::new("s1", "watch nvidia"), Some(tx), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.degraded);
        assert_eq!(outcome.message, "Added NVDA");
        assert_eq!(outcome.tool_results.len(), 1);
    }

    #[tokio::test]
    async fn test_narration_failure_without_text_summarizes_tools() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.push_tool_calls(vec![add_symbol_call("call_1", "TSLA")]);
        mock.push_error(ProviderError::provider("overloaded", Some("529")));

        let outcome = agent(&mock).process("s1", "watch tesla").await.unwrap();

        assert!(outcome.degraded);
        assert!(outcome.message.contains("add_symbol: added TSLA"));
        assert_eq!(outcome.tool_results.len(), 1);
    }

    #[tokio::test]
    async fn test_decision_failure_is_fatal() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.push_error(ProviderError::auth("bad key"));
        let store = Arc::new(InMemorySessionStore::new());

        let err = agent(&mock)
            .with_session_store(store.clone())
            .process("s1", "hi")
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Decision(ProviderError::Auth { .. })));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decision_timeout() {
        let mock = Arc::new(MockProviderBuilder::new().delay(Duration::from_secs(120)).build());
        let err = agent(&mock).process("s1", "hi").await.unwrap_err();
        assert!(matches!(err, AgentError::Decision(ProviderError::Timeout { seconds: 60 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_drops_in_flight_call() {
        let mock = Arc::new(MockProviderBuilder::new().delay(Duration::from_secs(30)).build());
        let store = Arc::new(InMemorySessionStore::new());
        let agent = agent(&mock).with_session_store(store.clone());
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };

        let err = agent
            .run_turn(TurnInput::new("s1", "hi"), None, &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, AgentError::Cancelled));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mock = Arc::new(MockLlmProvider::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = agent(&mock)
            .run_turn(TurnInput::new("s1", "hi"), None, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let mock = Arc::new(MockLlmProvider::new());
        let err = agent(&mock).process("s1", "   ").await.unwrap_err();
        assert!(matches!(err, AgentError::Context(_)));
    }

    #[tokio::test]
    async fn test_persistence_records_turn() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.push_tool_calls(vec![add_symbol_call("call_1", "AMD")]);
        mock.push_text("Done.");
        let store = Arc::new(InMemorySessionStore::new());

        agent(&mock)
            .with_session_store(store.clone())
            .process("s1", "watch amd")
            .await
            .unwrap();

        let entries = store.entries_for("s1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, LlmRole::User);
        assert_eq!(entries[1].content, "Done.");
        assert_eq!(entries[1].tool_calls[0].id, "call_1");
        assert_eq!(entries[1].tool_results.len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_errors_are_swallowed() {
        let mock = Arc::new(MockLlmProvider::new());
        let outcome = agent(&mock)
            .with_session_store(Arc::new(FailingStore))
            .process("s1", "hi")
            .await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn test_prompt_builder_failure_falls_back() {
        let mock = Arc::new(MockLlmProvider::new());
        let config = AgentConfig {
            system_prompt: "base prompt".to_string(),
            ..AgentConfig::default()
        };

        agent(&mock)
            .with_config(config)
            .with_prompt_builder(Arc::new(FailingPromptBuilder))
            .process("s1", "hi")
            .await
            .unwrap();

        let request = mock.last_request().unwrap();
        assert_eq!(request.system_prompt().as_deref(), Some("base prompt"));
    }

    #[tokio::test]
    async fn test_history_truncated_to_most_recent() {
        let mock = Arc::new(MockLlmProvider::new());
        let config = AgentConfig {
            max_history_messages: 2,
            model: Some("custom-model".to_string()),
            ..AgentConfig::default()
        };
        let history: Vec<LlmMessage> = (0..5).map(|i| LlmMessage::user(format!("msg {}", i))).collect();

        agent(&mock)
            .with_config(config)
            .run_turn(
                TurnInput::new("s1", "latest").with_history(history),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let request = mock.last_request().unwrap();
        let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(&contents[1..], &["msg 3", "msg 4", "latest"]);
        assert_eq!(request.model.as_deref(), Some("custom-model"));
    }

    /// Counts its runs and can raise a token once it has run
    struct TickerTool {
        runs: Arc<Mutex<Vec<String>>>,
        cancel_after_run: Option<CancellationToken>,
    }

    #[async_trait::async_trait]
    impl Tool for TickerTool {
        fn name(&self) -> &str {
            "refresh_quote"
        }

        fn description(&self) -> &str {
            "Refreshes a cached quote"
        }

        fn parameters(&self) -> Value {
            json!({ "type": "object", "properties": { "symbol": { "type": "string" } } })
        }

        async fn execute(&self, args: &Map<String, Value>) -> std::result::Result<ToolResult, ToolError> {
            let symbol = args.get("symbol").and_then(Value::as_str).unwrap_or("?").to_string();
            self.runs.lock().unwrap().push(symbol.clone());
            if let Some(cancel) = &self.cancel_after_run {
                cancel.cancel();
            }
            Ok(ToolResult::ok(json!({ "refreshed": symbol })))
        }
    }

    fn refresh_call(id: &str, symbol: &str) -> LlmToolCall {
        let mut args = Map::new();
        args.insert("symbol".to_string(), json!(symbol));
        LlmToolCall::new(id, "refresh_quote", args)
    }

    #[tokio::test]
    async fn test_tool_calls_ignored_when_no_tools_offered() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.push_response(
            CompletionResponse::text_response("I can only talk.", "mock-model", "mock")
                .with_tool_calls(vec![add_symbol_call("call_1", "AAPL")]),
        );
        let agent = AgentLoop::new(mock.clone(), Arc::new(ToolRegistry::new()));

        let outcome = agent.process("s1", "watch apple").await.unwrap();

        assert!(outcome.tool_calls.is_empty());
        assert!(outcome.tool_results.is_empty());
        assert_eq!(outcome.message, "I can only talk.");
        assert_eq!(mock.call_count(), 1);
        assert!(mock.requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn test_tool_calls_ignored_when_provider_lacks_tool_support() {
        struct NoToolsProvider(MockLlmProvider);

        #[async_trait::async_trait]
        impl LlmProvider for NoToolsProvider {
            fn name(&self) -> &str {
                self.0.name()
            }
            fn default_model(&self) -> &str {
                self.0.default_model()
            }
            fn supports_tools(&self) -> bool {
                false
            }
            fn is_available(&self) -> bool {
                true
            }
            async fn complete(
                &self,
                request: &CompletionRequest,
            ) -> std::result::Result<CompletionResponse, ProviderError> {
                self.0.complete(request).await
            }
            async fn stream(
                &self,
                request: &CompletionRequest,
            ) -> std::result::Result<crate::providers::ChunkStream, ProviderError> {
                self.0.stream(request).await
            }
            fn pricing(&self) -> &crate::providers::PricingTable {
                self.0.pricing()
            }
        }

        let inner = MockLlmProvider::new();
        inner.push_tool_calls(vec![add_symbol_call("call_1", "AAPL")]);
        let (tools, symbols) = watchlist();
        let agent = AgentLoop::new(Arc::new(NoToolsProvider(inner)), tools);

        let outcome = agent.process("s1", "watch apple").await.unwrap();

        assert!(outcome.tool_calls.is_empty());
        assert!(symbols.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_streamed_narration() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.push_tool_calls(vec![add_symbol_call("call_1", "AAPL")]);
        mock.push_stream(MockStream::Paced(
            vec!["Added ".into(), "AAPL ".into(), "for you.".into()],
            Duration::from_secs(1),
        ));
        let (tools, symbols) = watchlist();
        let store = Arc::new(InMemorySessionStore::new());
        let agent = AgentLoop::new(mock.clone(), tools).with_session_store(store.clone());
        let cancel = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                cancel.cancel();
            })
        };

        let err = agent
            .run_turn(TurnInput::new("s1", "watch apple"), Some(tx), &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, AgentError::Cancelled));
        let mut fragments = Vec::new();
        while let Ok(fragment) = rx.try_recv() {
            fragments.push(fragment);
        }
        assert_eq!(fragments, vec!["Added "]);
        // The tool ran before the cancel and stays done
        assert_eq!(*symbols.lock().unwrap(), vec!["AAPL".to_string()]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_tools_skips_the_rest() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.push_tool_calls(vec![
            refresh_call("call_1", "AAPL"),
            refresh_call("call_2", "MSFT"),
            refresh_call("call_3", "NVDA"),
        ]);
        mock.push_text("never requested");
        let cancel = CancellationToken::new();
        let runs = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ToolRegistry::new();
        registry
            .register(Box::new(TickerTool {
                runs: runs.clone(),
                cancel_after_run: Some(cancel.clone()),
            }))
            .unwrap();
        let store = Arc::new(InMemorySessionStore::new());
        let agent = AgentLoop::new(mock.clone(), Arc::new(registry)).with_session_store(store.clone());

        let err = agent
            .run_turn(TurnInput::new("s1", "refresh everything"), None, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(*runs.lock().unwrap(), vec!["AAPL".to_string()]);
        assert_eq!(mock.call_count(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_fail_turn() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.push_tool_calls(vec![add_symbol_call("call_1", "AMD")]);
        mock.push_stream(MockStream::Chunks(vec!["A".into(), "B".into()]));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);

        let outcome = agent(&mock)
            .run_turn(TurnInput::new("s1", "watch amd"), Some(tx), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.message, "AB");
        assert!(!outcome.degraded);
    }

    #[test]
    fn test_forward_reports_closed_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        assert!(forward(&tx, "s1", "x".to_string()));
        drop(rx);
        assert!(!forward(&tx, "s1", "y".to_string()));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short".to_string(), 10), "short");
        assert_eq!(truncate_chars("abcdef".to_string(), 3), format!("abc{}", TRUNCATION_MARKER));
        assert_eq!(truncate_chars("ééé".to_string(), 2), format!("éé{}", TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn test_call_guard_counts_both_requests() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.push_tool_calls(vec![add_symbol_call("call_1", "IBM")]);
        mock.push_text("ok");
        let guard = Arc::new(CallGuard::default());

        agent(&mock)
            .with_call_guard(guard.clone())
            .process("s1", "watch ibm")
            .await
            .unwrap();

        assert_eq!(guard.stats().rate.current_count, 2);
    }

    #[test]
    fn test_config_validation() {
        assert!(AgentConfig::default().validate().is_ok());
        let config = AgentConfig {
            request_timeout_seconds: 0,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

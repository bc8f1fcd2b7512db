//! Mock LLM provider for testing
//!
//! Responses are scripted as a queue: each `complete` pops the next entry and
//! falls back to the default response once the queue is empty. Streams work
//! the same way with their own queue.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;

use crate::providers::pricing::OPENAI_PRICING;
use crate::providers::{
    ChunkStream, CompletionRequest, CompletionResponse, FragmentStream, LlmProvider, LlmToolCall,
    PricingTable, ProviderError, terminated_stream,
};

/// A scripted streaming outcome
#[derive(Debug, Clone)]
pub enum MockStream {
    /// Emits the fragments, then the done chunk
    Chunks(Vec<String>),
    /// Emits the fragments, then fails mid-stream
    FailAfter(Vec<String>, ProviderError),
    /// Emits each fragment after waiting `gap`, then the done chunk
    Paced(Vec<String>, Duration),
    /// Fails before any chunk is produced
    Error(ProviderError),
}

/// Mock provider for testing
pub struct MockLlmProvider {
    name: &'static str,
    default_model: String,
    streaming: bool,
    delay: Option<Duration>,
    default_response: Mutex<CompletionResponse>,
    responses: Mutex<VecDeque<Result<CompletionResponse, ProviderError>>>,
    streams: Mutex<VecDeque<MockStream>>,
    requests: Mutex<Vec<CompletionRequest>>,
    call_count: Mutex<usize>,
    stream_count: Mutex<usize>,
}

impl MockLlmProvider {
    /// Creates a new mock provider with default settings
    pub fn new() -> Self {
        Self {
            name: "mock",
            default_model: "mock-model".to_string(),
            streaming: true,
            delay: None,
            default_response: Mutex::new(CompletionResponse::text_response(
                "Mock response",
                "mock-model",
                "mock",
            )),
            responses: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            call_count: Mutex::new(0),
            stream_count: Mutex::new(0),
        }
    }

    /// Sets the response returned once the script is exhausted
    pub fn set_response(&self, content: impl Into<String>) {
        *self.default_response.lock().unwrap() =
            CompletionResponse::text_response(content, self.default_model.clone(), self.name);
    }

    /// Queues a text response
    pub fn push_text(&self, content: impl Into<String>) {
        let response = CompletionResponse::text_response(content, self.default_model.clone(), self.name);
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queues a response carrying tool calls
    pub fn push_tool_calls(&self, tool_calls: Vec<LlmToolCall>) {
        let mut response = CompletionResponse::text_response("", self.default_model.clone(), self.name)
            .with_tool_calls(tool_calls);
        response.content = None;
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queues a full response
    pub fn push_response(&self, response: CompletionResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queues an error
    pub fn push_error(&self, error: ProviderError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Queues a streaming outcome
    pub fn push_stream(&self, stream: MockStream) {
        self.streams.lock().unwrap().push_back(stream);
    }

    /// Number of `complete` calls
    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    /// Number of `stream` calls
    pub fn stream_count(&self) -> usize {
        *self.stream_count.lock().unwrap()
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    /// Resets counters, captured requests and scripts
    pub fn reset(&self) {
        self.responses.lock().unwrap().clear();
        self.streams.lock().unwrap().clear();
        self.requests.lock().unwrap().clear();
        *self.call_count.lock().unwrap() = 0;
        *self.stream_count.lock().unwrap() = 0;
    }

    async fn simulate_latency(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        *self.call_count.lock().unwrap() += 1;
        self.requests.lock().unwrap().push(request.clone());

        self.simulate_latency().await;

        let scripted = self.responses.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(self.default_response.lock().unwrap().clone()),
        }
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        *self.stream_count.lock().unwrap() += 1;
        self.requests.lock().unwrap().push(request.clone());

        self.simulate_latency().await;

        let scripted = self.streams.lock().unwrap().pop_front();
        let items: Vec<Result<Option<String>, ProviderError>> = match scripted {
            Some(MockStream::Chunks(chunks)) => chunks.into_iter().map(|c| Ok(Some(c))).collect(),
            Some(MockStream::FailAfter(chunks, error)) => chunks
                .into_iter()
                .map(|c| Ok(Some(c)))
                .chain(std::iter::once(Err(error)))
                .collect(),
            Some(MockStream::Paced(chunks, gap)) => {
                let paced = stream::iter(chunks).then(move |chunk| async move {
                    tokio::time::sleep(gap).await;
                    Ok::<_, ProviderError>(Some(chunk))
                });
                let fragments: FragmentStream = Box::pin(paced);
                return Ok(terminated_stream(fragments));
            }
            Some(MockStream::Error(error)) => return Err(error),
            None => {
                let text = self.default_response.lock().unwrap().text().to_string();
                vec![Ok(Some(text))]
            }
        };

        let fragments: FragmentStream = Box::pin(stream::iter(items));
        Ok(terminated_stream(fragments))
    }

    fn pricing(&self) -> &PricingTable {
        &OPENAI_PRICING
    }
}

/// Builder for creating mock providers with specific configurations
pub struct MockProviderBuilder {
    provider: MockLlmProvider,
}

impl MockProviderBuilder {
    pub fn new() -> Self {
        Self {
            provider: MockLlmProvider::new(),
        }
    }

    pub fn name(mut self, name: &'static str) -> Self {
        self.provider.name = name;
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.provider.default_model = model.into();
        self
    }

    pub fn streaming(mut self, enabled: bool) -> Self {
        self.provider.streaming = enabled;
        self
    }

    /// Adds latency before every response
    pub fn delay(mut self, delay: Duration) -> Self {
        self.provider.delay = Some(delay);
        self
    }

    pub fn response(self, content: impl Into<String>) -> Self {
        self.provider.set_response(content);
        self
    }

    pub fn build(self) -> MockLlmProvider {
        self.provider
    }
}

impl Default for MockProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{LlmMessage, StreamChunk};
    use futures::StreamExt;
    use serde_json::Map;

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![LlmMessage::user("Hi")])
    }

    #[tokio::test]
    async fn test_script_then_default() {
        let mock = MockLlmProvider::new();
        mock.push_text("first");
        mock.push_error(ProviderError::network("down"));

        assert_eq!(mock.complete(&request()).await.unwrap().text(), "first");
        assert!(mock.complete(&request()).await.is_err());
        assert_eq!(mock.complete(&request()).await.unwrap().text(), "Mock response");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_tool_call_response_has_no_content() {
        let mock = MockLlmProvider::new();
        mock.push_tool_calls(vec![LlmToolCall::new("call_1", "t", Map::new())]);

        let response = mock.complete(&request()).await.unwrap();
        assert!(response.content.is_none());
        assert!(response.has_tool_calls());
    }

    #[tokio::test]
    async fn test_stream_script() {
        let mock = MockLlmProvider::new();
        mock.push_stream(MockStream::Chunks(vec!["A".into(), "B".into()]));

        let chunks: Vec<StreamChunk> = mock
            .stream(&request())
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(
            chunks,
            vec![StreamChunk::text("A"), StreamChunk::text("B"), StreamChunk::done()]
        );
        assert_eq!(mock.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_captures_requests_and_resets() {
        let mock = MockProviderBuilder::new().name("fake").default_model("fake-1").build();
        mock.complete(&request()).await.unwrap();

        assert_eq!(mock.name(), "fake");
        assert_eq!(mock.default_model(), "fake-1");
        assert_eq!(mock.last_request().unwrap().messages[0].content, "Hi");

        mock.reset();
        assert_eq!(mock.call_count(), 0);
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn test_mock_implements_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MockLlmProvider>();
    }
}

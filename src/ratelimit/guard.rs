//! The shared call context and a provider wrapper that goes through it

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::providers::{
    ChunkStream, CompletionRequest, CompletionResponse, LlmProvider, PricingTable, ProviderError,
};
use crate::ratelimit::{Deduplicator, RateLimitConfig, RateLimitStats, RateLimiter};

/// Snapshot of a [`CallGuard`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardStats {
    pub rate: RateLimitStats,
    pub pending_requests: usize,
}

/// Rate window plus in-flight map, shared by `Arc` between callers
pub struct CallGuard {
    limiter: Arc<RateLimiter>,
    dedup: Deduplicator<CompletionResponse>,
}

impl CallGuard {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_limiter(Arc::new(RateLimiter::new(config)))
    }

    /// Uses an existing limiter so other call sites share the same budget
    pub fn with_limiter(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            dedup: Deduplicator::new(),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Runs `call` under the budget, joining an identical in-flight call when keyed
    ///
    /// Only the caller that actually issues the request spends budget.
    pub async fn call<F>(
        &self,
        endpoint: &str,
        essential: bool,
        dedup_key: Option<String>,
        call: F,
    ) -> Result<CompletionResponse, ProviderError>
    where
        F: Future<Output = Result<CompletionResponse, ProviderError>> + Send + 'static,
    {
        let limiter = self.limiter.clone();
        let endpoint_owned = endpoint.to_string();
        let guarded = async move {
            limiter.acquire(&endpoint_owned, essential).await?;
            call.await
        };

        match dedup_key {
            Some(key) => self.dedup.run(key, guarded).await,
            None => guarded.await,
        }
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            rate: self.limiter.stats(),
            pending_requests: self.dedup.pending_count(),
        }
    }

    /// Clears the rate window and the in-flight map
    pub fn reset(&self) {
        self.limiter.reset();
        self.dedup.reset();
    }
}

impl Default for CallGuard {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// Identity of a request for deduplication: provider plus a hash of the body
pub fn dedup_key(provider: &str, request: &CompletionRequest) -> String {
    let mut hasher = DefaultHasher::new();
    match serde_json::to_string(request) {
        Ok(body) => body.hash(&mut hasher),
        Err(_) => format!("{:?}", request).hash(&mut hasher),
    }
    format!("{}:{:016x}", provider, hasher.finish())
}

/// [`LlmProvider`] that routes every call through a [`CallGuard`]
///
/// `complete` is rate limited and deduplicated; `stream` is rate limited only.
pub struct GuardedProvider {
    inner: Arc<dyn LlmProvider>,
    guard: Arc<CallGuard>,
    essential: bool,
}

impl GuardedProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, guard: Arc<CallGuard>) -> Self {
        Self {
            inner,
            guard,
            essential: false,
        }
    }

    /// Marks calls as essential: throttled but never refused
    pub fn essential(mut self, essential: bool) -> Self {
        self.essential = essential;
        self
    }

    pub fn guard(&self) -> &Arc<CallGuard> {
        &self.guard
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("{}:{}", self.inner.name(), operation)
    }
}

#[async_trait::async_trait]
impl LlmProvider for GuardedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    fn supports_tools(&self) -> bool {
        self.inner.supports_tools()
    }

    fn supports_streaming(&self) -> bool {
        self.inner.supports_streaming()
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let key = dedup_key(self.inner.name(), request);
        debug!(key = %key, essential = self.essential, "Guarded completion");

        let inner = self.inner.clone();
        let request = request.clone();
        self.guard
            .call(
                &self.endpoint("complete"),
                self.essential,
                Some(key),
                async move { inner.complete(&request).await },
            )
            .await
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        self.guard
            .limiter()
            .acquire(&self.endpoint("stream"), self.essential)
            .await?;
        self.inner.stream(request).await
    }

    fn pricing(&self) -> &PricingTable {
        self.inner.pricing()
    }

    fn estimate_cost(&self, prompt_tokens: u32, completion_tokens: u32, model: Option<&str>) -> f64 {
        self.inner.estimate_cost(prompt_tokens, completion_tokens, model)
    }
}

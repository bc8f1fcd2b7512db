//! Call-rate discipline for a shared, rate-limited upstream
//!
//! - [`RateLimiter`]: 60-second sliding window with graded throttling
//! - [`Deduplicator`]: one in-flight call per identical request
//! - [`CallGuard`]: both of the above as one explicitly shared context
//! - [`GuardedProvider`]: an [`LlmProvider`](crate::providers::LlmProvider)
//!   wrapper that sends every call through a `CallGuard`

mod dedup;
mod guard;
mod limiter;

pub use dedup::Deduplicator;
pub use guard::{CallGuard, GuardStats, GuardedProvider, dedup_key};
pub use limiter::{RateLimitConfig, RateLimitStats, RateLimiter, ThrottleLevel, WINDOW};

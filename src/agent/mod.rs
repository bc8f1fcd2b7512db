//! Tool-calling agent loop
//!
//! A turn is at most two provider requests: a bounded decision request with
//! the tool schemas attached, then, when tools ran, a narration request that
//! turns their results into an answer (streamed when a sink is supplied).

pub mod agent_loop;
pub mod context;
pub mod tools;

pub use agent_loop::{AgentConfig, AgentError, AgentLoop, Result, TurnInput, TurnOutcome};
pub use context::{
    InMemorySessionStore, NoopSessionStore, PromptBuilder, SessionEntry, SessionStore,
    StaticPromptBuilder,
};
pub use tools::{Tool, ToolError, ToolExecutor, ToolRegistry, ToolResult};

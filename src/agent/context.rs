//! Collaborators the agent loop delegates to: system prompt and persistence

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::Result;
use crate::agent::tools::ToolResult;
use crate::providers::{LlmMessage, LlmRole, LlmToolCall};
use crate::utils::StockpilotError;

/// Base prompt used when no other prompt is configured
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Stockpilot, an inventory and watchlist assistant. \
Use the available tools when the user asks you to change or inspect their data, \
then explain what you did in a short answer.";

/// Produces the system prompt for a session
#[async_trait::async_trait]
pub trait PromptBuilder: Send + Sync {
    async fn system_prompt(&self, session_id: &str) -> Result<String>;
}

/// Same prompt for every session
#[derive(Debug, Clone)]
pub struct StaticPromptBuilder {
    prompt: String,
}

impl StaticPromptBuilder {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl Default for StaticPromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT)
    }
}

#[async_trait::async_trait]
impl PromptBuilder for StaticPromptBuilder {
    async fn system_prompt(&self, _session_id: &str) -> Result<String> {
        Ok(self.prompt.clone())
    }
}

/// One persisted transcript entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub role: LlmRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<LlmToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    pub timestamp: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new(session_id: impl Into<String>, role: LlmRole, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_tool_activity(mut self, tool_calls: Vec<LlmToolCall>, tool_results: Vec<ToolResult>) -> Self {
        self.tool_calls = tool_calls;
        self.tool_results = tool_results;
        self
    }
}

/// Persists completed turns
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn record(&self, entry: SessionEntry) -> std::result::Result<(), StockpilotError>;
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSessionStore;

#[async_trait::async_trait]
impl SessionStore for NoopSessionStore {
    async fn record(&self, _entry: SessionEntry) -> std::result::Result<(), StockpilotError> {
        Ok(())
    }
}

/// Keeps every entry in memory, in recording order
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    entries: Mutex<Vec<SessionEntry>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<SessionEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn entries_for(&self, session_id: &str) -> Vec<SessionEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Replayable history for a session: user and assistant text only,
    /// most recent `limit` messages
    pub fn history(&self, session_id: &str, limit: usize) -> Vec<LlmMessage> {
        let messages: Vec<LlmMessage> = self
            .entries_for(session_id)
            .into_iter()
            .filter(|entry| matches!(entry.role, LlmRole::User | LlmRole::Assistant))
            .filter(|entry| !entry.content.is_empty())
            .map(|entry| LlmMessage::new(entry.role, entry.content))
            .collect();
        let skip = messages.len().saturating_sub(limit);
        messages.into_iter().skip(skip).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn record(&self, entry: SessionEntry) -> std::result::Result<(), StockpilotError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        Ok(())
    }
}

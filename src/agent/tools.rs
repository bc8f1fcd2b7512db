//! Tool execution contract and the registry that implements it
//!
//! The agent loop only sees [`ToolExecutor`]. Executors are total: whatever
//! goes wrong inside a tool comes back as an error-bearing [`ToolResult`],
//! never as an `Err`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::providers::ToolDefinition;

/// Outcome of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Structured result fed back to the model
    pub result: Value,
    /// Optional human-readable rendering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    /// Set when the tool failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            display: None,
            error: None,
        }
    }

    /// Error-bearing result; the model sees `{"error": message}`
    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            result: json!({ "error": message }),
            display: None,
            error: Some(message),
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// JSON text placed in the transcript for this result
    pub fn transcript_content(&self) -> String {
        match (&self.error, &self.result) {
            (Some(error), Value::Null) => json!({ "error": error }).to_string(),
            _ => self.result.to_string(),
        }
    }
}

/// Executes tools on behalf of the agent loop
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Runs the named tool; never fails, errors are encoded in the result
    async fn execute_tool(&self, name: &str, arguments: &Map<String, Value>) -> ToolResult;

    /// Schemas offered to the model
    fn tool_definitions(&self) -> Vec<ToolDefinition>;
}

/// Error types for tool execution
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Tool '{tool}' execution failed: {message}")]
    ExecutionFailed { tool: String, message: String },
}

impl ToolError {
    pub fn invalid_arguments(tool: &str, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    pub fn execution_failed(tool: &str, message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    /// Get the tool name from the error
    pub fn tool_name(&self) -> &str {
        match self {
            ToolError::NotFound(name) => name,
            ToolError::InvalidArguments { tool, .. } => tool,
            ToolError::ExecutionFailed { tool, .. } => tool,
        }
    }
}

/// Trait for implementing tools that the agent can use
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Returns the unique name of the tool
    fn name(&self) -> &str;

    /// Returns a description of what the tool does
    fn description(&self) -> &str;

    /// Returns the JSON Schema for the tool's parameters
    fn parameters(&self) -> Value;

    /// Executes the tool with already-validated arguments
    async fn execute(&self, args: &Map<String, Value>) -> Result<ToolResult, ToolError>;
}

/// Checks that every `required` property of an object schema is present
pub fn validate_required_args(
    args: &Map<String, Value>,
    schema: &Value,
    tool_name: &str,
) -> Result<(), ToolError> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };

    for field in required.iter().filter_map(Value::as_str) {
        if !args.contains_key(field) {
            return Err(ToolError::invalid_arguments(
                tool_name,
                format!("Missing required parameter '{}'", field),
            ));
        }
    }

    Ok(())
}

/// Registry for managing available tools
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registers a tool in the registry
    ///
    /// # Errors
    /// Returns an error if a tool with the same name is already registered
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();

        if self.tools.contains_key(&name) {
            return Err(ToolError::execution_failed(
                &name,
                format!("Tool '{}' is already registered", name),
            ));
        }

        self.tools.insert(name, tool);
        Ok(())
    }

    /// Retrieves a tool by name
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Lists all registered tools with their descriptions, sorted by name
    pub fn list_tools(&self) -> Vec<(&str, &str)> {
        let mut tools: Vec<(&str, &str)> = self
            .tools
            .values()
            .map(|t| (t.name(), t.description()))
            .collect();
        tools.sort_by_key(|(name, _)| *name);
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    async fn run(&self, name: &str, arguments: &Map<String, Value>) -> Result<ToolResult, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        validate_required_args(arguments, &tool.parameters(), name)?;
        tool.execute(arguments).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute_tool(&self, name: &str, arguments: &Map<String, Value>) -> ToolResult {
        debug!(tool = %name, "Executing tool");
        match self.run(name, arguments).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %e.tool_name(), error = %e, "Tool failed");
                ToolResult::failure(e.to_string())
            }
        }
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition::new(tool.name(), tool.description(), tool.parameters()))
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes its input"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "input": { "type": "string" } },
                "required": ["input"]
            })
        }

        async fn execute(&self, args: &Map<String, Value>) -> Result<ToolResult, ToolError> {
            let input = args
                .get("input")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::invalid_arguments("echo", "'input' must be a string"))?;
            Ok(ToolResult::ok(json!({ "echo": input })).with_display(input.to_string()))
        }
    }

    struct BrokenTool;

    #[async_trait::async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        fn parameters(&self) -> Value {
            json!({ "type": "object", "properties": {} })
        }

        async fn execute(&self, _args: &Map<String, Value>) -> Result<ToolResult, ToolError> {
            Err(ToolError::execution_failed("broken", "upstream unavailable"))
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool)).unwrap();
        registry.register(Box::new(BrokenTool)).unwrap();
        registry
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = registry();
        assert!(registry.register(Box::new(EchoTool)).is_err());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_definitions_sorted() {
        let names: Vec<String> = registry().tool_definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["broken", "echo"]);
        assert_eq!(registry().list_tools()[0], ("broken", "Always fails"));
    }

    #[tokio::test]
    async fn test_successful_execution() {
        let result = registry().execute_tool("echo", &args(json!({"input": "hi"}))).await;
        assert!(!result.is_error());
        assert_eq!(result.result, json!({"echo": "hi"}));
        assert_eq!(result.display.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_failures_are_results() {
        let registry = registry();

        let missing = registry.execute_tool("nope", &Map::new()).await;
        assert!(missing.is_error());
        assert!(missing.error.unwrap().contains("Tool not found"));

        let invalid = registry.execute_tool("echo", &Map::new()).await;
        assert!(invalid.error.as_deref().unwrap().contains("Missing required parameter 'input'"));

        let failed = registry.execute_tool("broken", &Map::new()).await;
        assert_eq!(failed.result["error"], "Tool 'broken' execution failed: upstream unavailable");
    }

    #[test]
    fn test_transcript_content() {
        assert_eq!(ToolResult::ok(json!({"a": 1})).transcript_content(), r#"{"a":1}"#);

        let bare_error = ToolResult {
            result: Value::Null,
            display: None,
            error: Some("boom".to_string()),
        };
        assert_eq!(bare_error.transcript_content(), r#"{"error":"boom"}"#);
    }
}

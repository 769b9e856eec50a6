//! Tool Gateway: a name-keyed registry of tools the model may call.
//!
//! The turn engine only ever talks to [`ToolGateway`]; adding a tool means
//! registering another [`Tool`] implementation, not touching the loop.

pub mod tavily;
pub mod web_search;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::errors::AppError;
use crate::models::ToolCall;

/// Schema advertised to the model for one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Normalized outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Body of the tool-result message handed back to the model.
    pub content: String,
    /// The only part of the result that crosses the streaming boundary.
    pub urls: Vec<String>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    /// Text shown to the client when the call starts.
    fn query(&self, arguments: &Value) -> String {
        arguments_object(arguments)
            .and_then(|args| args.get("query").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default()
    }

    async fn invoke(&self, arguments: &Value) -> Result<ToolOutput, AppError>;
}

/// Some providers deliver arguments as a JSON-encoded string rather than an
/// object; both forms are accepted.
pub fn arguments_object(arguments: &Value) -> Option<serde_json::Map<String, Value>> {
    match arguments {
        Value::Object(map) => Some(map.clone()),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

#[derive(Clone, Default)]
pub struct ToolGateway {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, tool: Arc<dyn Tool>) -> Self {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
        self
    }

    /// Definitions in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition())
            .collect()
    }

    /// Resolves the tool for `call`; unknown names fail the turn.
    pub fn resolve(&self, call: &ToolCall) -> Result<Arc<dyn Tool>, AppError> {
        self.tools
            .get(&call.name)
            .cloned()
            .ok_or_else(|| AppError::UnknownToolRequested { tool_name: call.name.clone() })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".into(),
                description: "Echoes the query".into(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn invoke(&self, arguments: &Value) -> Result<ToolOutput, AppError> {
            Ok(ToolOutput { content: self.query(arguments), urls: vec![] })
        }
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall { id: "call_1".into(), name: name.into(), arguments }
    }

    #[tokio::test]
    async fn resolves_registered_tool_by_name() {
        let gateway = ToolGateway::new().register(Arc::new(EchoTool));
        let echo = call("echo", json!({"query": "hi"}));
        let output = gateway.resolve(&echo).unwrap().invoke(&echo.arguments).await.unwrap();
        assert_eq!(output.content, "hi");
        assert_eq!(gateway.definitions().len(), 1);
    }

    #[test]
    fn unknown_tool_fails() {
        let gateway = ToolGateway::new().register(Arc::new(EchoTool));
        let err = gateway.resolve(&call("calculator", json!({}))).err().unwrap();
        assert!(matches!(err, AppError::UnknownToolRequested { tool_name } if tool_name == "calculator"));
    }

    #[test]
    fn string_encoded_arguments_are_accepted() {
        let args = Value::String(r#"{"query":"Tokyo weather"}"#.into());
        assert_eq!(EchoTool.query(&args), "Tokyo weather");
        assert_eq!(EchoTool.query(&json!(42)), "");
    }

    #[test]
    fn registering_twice_keeps_one_definition() {
        let gateway = ToolGateway::new().register(Arc::new(EchoTool)).register(Arc::new(EchoTool));
        assert_eq!(gateway.definitions().len(), 1);
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool handler registry for bridged `mcp/request` envelopes.
//!
//! The gateway never inspects tool payloads; validation of the inner
//! JSON-RPC-shaped request is the participant's job and happens here.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Failure of a single tool invocation, carried back inside the
/// `mcp/response` payload as a JSON-RPC-shaped error object.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl ToolError {
    /// Standard "method not found" error for unknown tools.
    #[must_use]
    pub fn unknown_tool(name: &str) -> Self {
        Self {
            code: -32601,
            message: format!("unknown tool: {name}"),
        }
    }

    /// Invalid-params error.
    #[must_use]
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: detail.into(),
        }
    }

    /// Generic execution failure.
    #[must_use]
    pub fn execution(detail: impl Into<String>) -> Self {
        Self {
            code: -32000,
            message: detail.into(),
        }
    }
}

/// One callable tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool with the request's `arguments` object.
    async fn call(&self, arguments: Value) -> Result<Value, ToolError>;
}

/// Convenience: any async-free closure over `Value` is a tool.
#[async_trait]
impl<F> ToolHandler for F
where
    F: Fn(Value) -> Result<Value, ToolError> + Send + Sync,
{
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        self(arguments)
    }
}

/// Named tool handlers for one participant.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a tool name.
    pub fn register(&mut self, name: impl Into<String>, handler: impl ToolHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Registered tool names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// True when no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch a `tools/call` request payload. Returns the `mcp/response`
    /// payload body: `{"result": ...}` or `{"error": {...}}`.
    pub async fn dispatch(&self, request_payload: &Value) -> Value {
        let method = request_payload.get("method").and_then(Value::as_str);
        if method != Some("tools/call") {
            return error_body(&ToolError {
                code: -32601,
                message: format!("unsupported method: {}", method.unwrap_or("<missing>")),
            });
        }
        let params = request_payload.get("params").cloned().unwrap_or(Value::Null);
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return error_body(&ToolError::invalid_params("params.name is required"));
        };
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));

        match self.handlers.get(name) {
            Some(handler) => match handler.call(arguments).await {
                Ok(result) => serde_json::json!({ "result": result }),
                Err(err) => error_body(&err),
            },
            None => error_body(&ToolError::unknown_tool(name)),
        }
    }
}

fn error_body(err: &ToolError) -> Value {
    serde_json::json!({
        "error": { "code": err.code, "message": err.message }
    })
}

//! The in-process tool server router (C6): JSON-RPC tunneled over `mcp_message`
//! control requests, dispatched to embedder-supplied tool handlers.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ToolError;
use crate::future::BoxFuture;

/// One content block of a tool call result. Only text blocks are modeled; the CLI's
/// richer content types are out of scope for an in-process SDK tool.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
}

/// Outcome of one `tools/call` invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        ToolCallResult {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        ToolCallResult {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }
}

type ToolHandlerFn = Arc<dyn Fn(Value) -> BoxFuture<'static, ToolCallResult> + Send + Sync>;

/// One tool's declaration: its schema plus the handler that runs `tools/call`.
#[derive(Clone)]
pub struct ToolDecl {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub annotations: Option<Value>,
    handler: ToolHandlerFn,
}

impl ToolDecl {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ToolCallResult> + Send + 'static,
    {
        ToolDecl {
            name: name.into(),
            description: description.into(),
            input_schema,
            annotations: None,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    fn list_entry(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
            "annotations": self.annotations,
        })
    }
}

/// One in-process MCP server: a named bundle of tools exposed to the CLI.
pub struct ToolServer {
    pub name: String,
    pub version: String,
    pub tools: Vec<ToolDecl>,
}

impl ToolServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>, tools: Vec<ToolDecl>) -> Self {
        ToolServer {
            name: name.into(),
            version: version.into(),
            tools,
        }
    }

    fn find(&self, tool_name: &str) -> Option<&ToolDecl> {
        self.tools.iter().find(|decl| decl.name == tool_name)
    }
}

/// Routes `mcp_message` JSON-RPC envelopes to registered in-process tool servers.
pub struct ToolRouter {
    servers: Mutex<HashMap<String, Arc<ToolServer>>>,
}

impl ToolRouter {
    pub fn new() -> Self {
        ToolRouter {
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_server(&self, server: ToolServer) -> Result<(), ToolError> {
        let mut servers = self.servers.lock().await;
        if servers.contains_key(&server.name) {
            return Err(ToolError::DuplicateServer(server.name));
        }
        servers.insert(server.name.clone(), Arc::new(server));
        Ok(())
    }

    pub async fn server_names(&self) -> Vec<String> {
        self.servers.lock().await.keys().cloned().collect()
    }

    /// Handles one JSON-RPC request addressed to `server_name`, always returning a
    /// complete JSON-RPC response envelope (errors are carried inside it, never
    /// propagated as a `Result`, matching how the CLI expects `mcp_response`).
    pub async fn handle_message(&self, server_name: &str, rpc: Value) -> Value {
        let id = rpc.get("id").cloned().unwrap_or(Value::Null);
        let server = {
            let servers = self.servers.lock().await;
            servers.get(server_name).cloned()
        };
        let Some(server) = server else {
            return jsonrpc_error(id, -32601, format!("unknown mcp server: {server_name}"));
        };

        let method = rpc.get("method").and_then(Value::as_str).unwrap_or_default();
        match method {
            "initialize" => jsonrpc_result(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": server.name, "version": server.version },
                }),
            ),
            "tools/list" => {
                let tools: Vec<Value> = server.tools.iter().map(ToolDecl::list_entry).collect();
                jsonrpc_result(id, json!({ "tools": tools }))
            }
            "tools/call" => {
                let params = rpc.get("params").cloned().unwrap_or(Value::Null);
                let tool_name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let args = params.get("arguments").cloned().unwrap_or(json!({}));

                let Some(decl) = server.find(tool_name) else {
                    return jsonrpc_error(id, -32602, format!("unknown tool: {tool_name}"));
                };
                if let Err(message) = validate_args(&decl.input_schema, &args) {
                    return jsonrpc_result(id, serde_json::to_value(ToolCallResult::error(message)).unwrap());
                }

                let handler = Arc::clone(&decl.handler);
                let result = match tokio::spawn(async move { handler(args).await }).await {
                    Ok(result) => result,
                    Err(join_err) => {
                        warn!(%join_err, tool = %tool_name, "tool handler panicked");
                        ToolCallResult::error(format!("tool handler panicked: {join_err}"))
                    }
                };
                jsonrpc_result(id, serde_json::to_value(result).unwrap_or(Value::Null))
            }
            other => jsonrpc_error(id, -32601, format!("unsupported method: {other}")),
        }
    }
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal JSON-Schema-shaped validation: object-ness, `required`, and declared
/// top-level property types. No `$ref`, `oneOf`, or nested schema support.
fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(args_obj) = args.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required {
            let Some(field) = field.as_str() else { continue };
            if !args_obj.contains_key(field) {
                return Err(format!("missing required argument: {field}"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in args_obj {
            let Some(prop_schema) = properties.get(name) else {
                continue;
            };
            if let Some(expected) = prop_schema.get("type").and_then(Value::as_str) {
                if !type_matches(expected, value) {
                    return Err(format!("argument {name} must be of type {expected}"));
                }
            }
        }
    }

    Ok(())
}

fn type_matches(ty: &str, value: &Value) -> bool {
    match ty {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn jsonrpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn jsonrpc_error(id: Value, code: i64, message: String) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator_server() -> ToolServer {
        let add = ToolDecl::new(
            "add",
            "Adds two numbers",
            json!({
                "type": "object",
                "properties": { "a": {"type": "number"}, "b": {"type": "number"} },
                "required": ["a", "b"],
            }),
            |args: Value| async move {
                let a = args["a"].as_f64().unwrap_or(0.0);
                let b = args["b"].as_f64().unwrap_or(0.0);
                ToolCallResult::text((a + b).to_string())
            },
        );
        ToolServer::new("calculator", "1.0.0", vec![add])
    }

    #[tokio::test]
    async fn registers_and_lists_tools() {
        let router = ToolRouter::new();
        router.register_server(calculator_server()).await.unwrap();

        let response = router
            .handle_message("calculator", json!({"jsonrpc":"2.0","id":1,"method":"tools/list"}))
            .await;
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], json!("add"));
    }

    #[tokio::test]
    async fn duplicate_server_name_rejected() {
        let router = ToolRouter::new();
        router.register_server(calculator_server()).await.unwrap();
        let err = router.register_server(calculator_server()).await.unwrap_err();
        assert!(matches!(err, ToolError::DuplicateServer(name) if name == "calculator"));
    }

    #[tokio::test]
    async fn calls_tool_and_returns_text_result() {
        let router = ToolRouter::new();
        router.register_server(calculator_server()).await.unwrap();

        let response = router
            .handle_message(
                "calculator",
                json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "tools/call",
                    "params": { "name": "add", "arguments": { "a": 2, "b": 3 } },
                }),
            )
            .await;
        assert_eq!(response["result"]["isError"], json!(false));
        assert_eq!(response["result"]["content"][0]["text"], json!("5"));
    }

    #[tokio::test]
    async fn missing_required_argument_is_reported_as_error_result() {
        let router = ToolRouter::new();
        router.register_server(calculator_server()).await.unwrap();

        let response = router
            .handle_message(
                "calculator",
                json!({
                    "jsonrpc": "2.0",
                    "id": 3,
                    "method": "tools/call",
                    "params": { "name": "add", "arguments": { "a": 2 } },
                }),
            )
            .await;
        assert_eq!(response["result"]["isError"], json!(true));
    }

    #[tokio::test]
    async fn unknown_server_returns_jsonrpc_error() {
        let router = ToolRouter::new();
        let response = router
            .handle_message("nope", json!({"jsonrpc":"2.0","id":1,"method":"tools/list"}))
            .await;
        assert_eq!(response["error"]["code"], json!(-32601));
    }
}

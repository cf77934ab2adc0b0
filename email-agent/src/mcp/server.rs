//! Minimal MCP server exposing a [`ToolManager`] over newline-delimited JSON-RPC.

use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, Implementation, InitializeRequestParams,
    InitializeResult, ListToolsResult, RequestId, RpcError, ServerCapabilities,
    ServerCapabilitiesTools,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::MCPError;
use super::protocol;
use crate::tools::{ToolError, ToolManager};

pub const SERVER_NAME: &str = "email-agent-tools";

/// Envelope fields needed to tell requests, notifications and invalid frames apart.
#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

/// Serves requests until the reader reaches end of input.
pub async fn serve<R, W>(tools: &ToolManager, reader: R, mut writer: W) -> Result<(), MCPError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let Some(reply) = handle_line(tools, &line).await else {
            continue;
        };
        let mut out =
            serde_json::to_string(&reply).map_err(|e| MCPError::ProtocolError(e.to_string()))?;
        out.push('\n');
        writer
            .write_all(out.as_bytes())
            .await
            .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;
    }
    debug!("MCP client disconnected");
    Ok(())
}

pub async fn serve_stdio(tools: &ToolManager) -> Result<(), MCPError> {
    info!(tools = ?tools.list(), "Serving tools over stdio");
    serve(tools, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

async fn handle_line(tools: &ToolManager, line: &str) -> Option<Value> {
    let raw: Value = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            let error = RpcError::parse_error().with_message(&format!("Parse error: {e}"));
            return Some(error_reply(None, error));
        }
    };
    // Echo the id when it is usable, even if the rest of the frame is not.
    let fallback_id = raw
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
    let frame = match serde_json::from_value::<Frame>(raw) {
        Ok(frame) if frame.jsonrpc.as_deref() == Some(protocol::JSONRPC_VERSION) => frame,
        Ok(_) | Err(_) => {
            let error = RpcError::invalid_request().with_message("Invalid Request");
            return Some(error_reply(fallback_id, error));
        }
    };

    match (frame.id, frame.method) {
        (Some(id), Some(method)) => {
            let params = frame.params.unwrap_or(Value::Null);
            Some(match dispatch(tools, &method, params).await {
                Ok(result) => json!({
                    "jsonrpc": protocol::JSONRPC_VERSION,
                    "id": id,
                    "result": result,
                }),
                Err(error) => error_reply(Some(id), error),
            })
        }
        (None, Some(method)) => {
            debug!(%method, "Ignoring notification");
            None
        }
        (id, None) => {
            let error = RpcError::invalid_request().with_message("Invalid Request: no method");
            Some(error_reply(id, error))
        }
    }
}

fn error_reply(id: Option<RequestId>, error: RpcError) -> Value {
    json!({
        "jsonrpc": protocol::JSONRPC_VERSION,
        "id": id,
        "error": error,
    })
}

async fn dispatch(tools: &ToolManager, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        protocol::METHOD_INITIALIZE => to_value(&initialize(params)),
        protocol::METHOD_PING => Ok(json!({})),
        protocol::METHOD_LIST_TOOLS => to_value(&list_tools(tools)?),
        protocol::METHOD_CALL_TOOL => to_value(&call_tool(tools, params).await?),
        other => Err(RpcError::method_not_found().with_message(&format!("Method not found: {other}"))),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal_error().with_message(&e.to_string()))
}

fn internal(error: MCPError) -> RpcError {
    RpcError::internal_error().with_message(&error.to_string())
}

fn initialize(params: Value) -> InitializeResult {
    let protocol_version = serde_json::from_value::<InitializeRequestParams>(params)
        .map(|p| p.protocol_version)
        .unwrap_or_else(|_| protocol::LATEST_PROTOCOL_VERSION.to_string());
    InitializeResult {
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools::default()),
            ..Default::default()
        },
        instructions: None,
        meta: None,
        protocol_version,
        server_info: Implementation {
            name: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            description: None,
            icons: Vec::new(),
            website_url: None,
        },
    }
}

fn list_tools(tools: &ToolManager) -> Result<ListToolsResult, RpcError> {
    let listed = tools
        .infos()
        .into_iter()
        .map(|info| protocol::tool(&info.name, Some(&info.description), info.parameters))
        .collect::<Result<Vec<_>, _>>()
        .map_err(internal)?;
    Ok(ListToolsResult {
        meta: None,
        next_cursor: None,
        tools: listed,
    })
}

async fn call_tool(tools: &ToolManager, params: Value) -> Result<CallToolResult, RpcError> {
    let params: CallToolRequestParams = serde_json::from_value(params).map_err(|e| {
        RpcError::invalid_params().with_message(&format!("Invalid tools/call params: {e}"))
    })?;
    let name = params.name;
    let arguments = params.arguments.map(Value::Object).unwrap_or_else(|| json!({}));

    let (text, is_error) = match tools.get(&name) {
        None => (format!("Unknown tool: {name}"), true),
        Some(tool) => match tool.execute(arguments).await {
            Ok(Value::String(text)) => (text, false),
            Ok(value) => (value.to_string(), false),
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool execution failed");
                (render_error(&e), true)
            }
        },
    };
    protocol::text_result(text, is_error).map_err(internal)
}

fn render_error(error: &ToolError) -> String {
    format!("Error: {error}")
}

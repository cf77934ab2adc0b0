//! Adapters between `rust_mcp_schema` messages and the session traits.

use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, ClientCapabilities, ContentBlock, Implementation,
    InitializeRequestParams, InitializeResult, ListToolsResult, PaginatedRequestParams, RequestId,
    Tool,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

pub use rust_mcp_schema::LATEST_PROTOCOL_VERSION;

use super::MCPError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_PING: &str = "ping";
pub const METHOD_LIST_TOOLS: &str = "tools/list";
pub const METHOD_CALL_TOOL: &str = "tools/call";

fn protocol_error(error: impl std::fmt::Display) -> MCPError {
    MCPError::ProtocolError(error.to_string())
}

pub fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Email agent".to_string()),
            description: None,
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

pub fn request_message(id: i64, request: RequestFromClient) -> Result<ClientMessage, MCPError> {
    ClientMessage::from_message(
        MessageFromClient::RequestFromClient(request),
        Some(RequestId::Integer(id)),
    )
    .map_err(protocol_error)
}

pub fn initialized_message() -> Result<ClientMessage, MCPError> {
    ClientMessage::from_message(
        MessageFromClient::NotificationFromClient(NotificationFromClient::InitializedNotification(
            None,
        )),
        None,
    )
    .map_err(protocol_error)
}

pub fn list_tools_request(cursor: Option<String>) -> RequestFromClient {
    RequestFromClient::ListToolsRequest(cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    }))
}

/// `tools/call` request; arguments must be a JSON object or null.
pub fn call_tool_request(name: &str, arguments: Value) -> Result<RequestFromClient, MCPError> {
    let params = CallToolRequestParams::new(name);
    let params = match arguments {
        Value::Null => params,
        Value::Object(arguments) => params.with_arguments(arguments),
        other => {
            return Err(MCPError::ProtocolError(format!(
                "Arguments for {name} must be a JSON object, got {other}"
            )));
        }
    };
    Ok(RequestFromClient::CallToolRequest(params))
}

/// Id of a response or error frame; `None` for server requests and notifications.
pub fn reply_id(message: &ServerMessage) -> Option<&RequestId> {
    match message {
        ServerMessage::Response(response) => Some(&response.id),
        ServerMessage::Error(error) => error.id.as_ref(),
        _ => None,
    }
}

pub fn is_reply_to(message: &ServerMessage, id: i64) -> bool {
    reply_id(message) == Some(&RequestId::Integer(id))
}

/// Unwraps a reply into its `result`, mapping JSON-RPC errors.
pub fn response_value(message: ServerMessage) -> Result<Value, MCPError> {
    match message {
        ServerMessage::Response(response) => {
            serde_json::to_value(&response.result).map_err(protocol_error)
        }
        ServerMessage::Error(error) => Err(MCPError::Rpc {
            code: error.error.code,
            message: error.error.message,
        }),
        other => Err(MCPError::ProtocolError(format!(
            "Unexpected MCP server message: {other:?}"
        ))),
    }
}

pub fn parse_response<T: DeserializeOwned>(message: ServerMessage) -> Result<T, MCPError> {
    serde_json::from_value(response_value(message)?).map_err(protocol_error)
}

pub fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, MCPError> {
    let result: InitializeResult = parse_response(message)?;
    if result.protocol_version.trim().is_empty() {
        return Err(MCPError::ProtocolError(
            "Initialize response has no protocol version".to_string(),
        ));
    }
    Ok(result)
}

/// Decodes a `tools/list` page tool by tool, so a bad entry is reported by name.
pub fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, MCPError> {
    let mut value = response_value(message)?;
    let next_cursor = value
        .get("nextCursor")
        .and_then(Value::as_str)
        .map(str::to_string);
    let raw_tools = match value.get_mut("tools").map(Value::take) {
        Some(Value::Array(tools)) => tools,
        None | Some(Value::Null) => Vec::new(),
        Some(other) => {
            return Err(MCPError::ProtocolError(format!(
                "tools/list returned {other} instead of a list"
            )));
        }
    };
    let tools = raw_tools
        .into_iter()
        .map(decode_tool)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ListToolsResult {
        meta: None,
        next_cursor,
        tools,
    })
}

/// Builds a tool entry, filling in an empty object schema when none is given.
pub fn tool(name: &str, description: Option<&str>, input_schema: Value) -> Result<Tool, MCPError> {
    decode_tool(json!({
        "name": name,
        "description": description,
        "inputSchema": input_schema,
    }))
}

fn decode_tool(mut raw: Value) -> Result<Tool, MCPError> {
    let label = match raw.get("name").and_then(Value::as_str).map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "<unnamed>".to_string(),
    };
    let malformed = |reason: String| MCPError::MalformedSchema {
        tool: label.clone(),
        reason,
    };

    let Value::Object(fields) = &mut raw else {
        return Err(malformed("tool entry must be an object".to_string()));
    };
    if fields.get("description").is_some_and(Value::is_null) {
        fields.remove("description");
    }
    match fields.get_mut("inputSchema") {
        None | Some(Value::Null) => {
            fields.insert(
                "inputSchema".to_string(),
                json!({"type": "object", "properties": {}}),
            );
        }
        Some(Value::Object(schema)) => match schema.get("type") {
            None => {
                schema.insert("type".to_string(), json!("object"));
            }
            Some(Value::String(kind)) if kind == "object" => {}
            Some(other) => {
                return Err(malformed(format!(
                    "input schema type must be \"object\", got {other}"
                )));
            }
        },
        Some(other) => {
            return Err(malformed(format!("input schema must be an object, got {other}")));
        }
    }

    serde_json::from_value(raw).map_err(|e| malformed(e.to_string()))
}

/// Text blocks joined by newlines; other block types rendered as JSON.
pub fn flatten_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::TextContent(text) => text.text.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn text_result(text: impl Into<String>, is_error: bool) -> Result<CallToolResult, MCPError> {
    serde_json::from_value(json!({
        "content": [{"type": "text", "text": text.into()}],
        "isError": is_error,
    }))
    .map_err(protocol_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn server_message(raw: Value) -> ServerMessage {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn request_frames_carry_integer_ids() {
        let message = request_message(3, list_tools_request(None)).unwrap();
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 3);
        assert_eq!(value["method"], METHOD_LIST_TOOLS);
    }

    #[test]
    fn initialized_notification_has_no_id() {
        let value = serde_json::to_value(initialized_message().unwrap()).unwrap();
        assert_eq!(value["method"], "notifications/initialized");
        assert!(value.get("id").is_none_or(Value::is_null));
    }

    #[test]
    fn call_arguments_must_be_objects() {
        assert!(call_tool_request("x", json!({"a": 1})).is_ok());
        assert!(call_tool_request("x", Value::Null).is_ok());
        assert!(matches!(
            call_tool_request("x", json!([1, 2])),
            Err(MCPError::ProtocolError(_))
        ));
    }

    #[test]
    fn error_frames_map_to_rpc_error() {
        let message = server_message(json!({
            "jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "unknown"}
        }));
        assert!(is_reply_to(&message, 1));
        match response_value(message) {
            Err(MCPError::Rpc { code, message }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "unknown");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn server_requests_are_not_replies() {
        let request = server_message(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
        assert!(!is_reply_to(&request, 1));
        assert!(response_value(request).is_err());
    }

    #[test]
    fn initialize_requires_protocol_version() {
        let message = server_message(json!({
            "jsonrpc": "2.0",
            "id": 0,
            "result": {
                "protocolVersion": " ",
                "capabilities": {},
                "serverInfo": {"name": "x", "version": "1.0.0"}
            }
        }));
        assert!(parse_initialize_result(message).is_err());
    }

    #[test]
    fn flatten_text_joins_blocks() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image", "data": "AA==", "mimeType": "image/png"},
                {"type": "text", "text": "second"}
            ]
        }))
        .unwrap();
        let flattened = flatten_text(&result);
        assert!(flattened.starts_with("first\n"));
        assert!(flattened.ends_with("\nsecond"));
        assert!(flattened.contains("\"image\""));
    }

    #[test]
    fn text_result_sets_error_flag() {
        let result = text_result("boom", true).unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(flatten_text(&result), "boom");
    }

    #[test]
    fn list_tools_reads_pages() {
        let message = server_message(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {
                "tools": [
                    {"name": "x", "inputSchema": {"type": "object"}},
                    {"name": "y", "description": "why", "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}}
                ],
                "nextCursor": "page-2"
            }
        }));
        let page = parse_list_tools(message).unwrap();
        assert_eq!(page.tools[0].name, "x");
        assert_eq!(page.tools[1].description.as_deref(), Some("why"));
        assert_eq!(page.next_cursor.as_deref(), Some("page-2"));
    }

    #[rstest]
    #[case(json!("not a schema"))]
    #[case(json!({"type": "string"}))]
    #[case(json!(["type", "object"]))]
    fn tool_rejects_non_object_schemas(#[case] schema: Value) {
        match tool("bad", None, schema) {
            Err(MCPError::MalformedSchema { tool, .. }) => assert_eq!(tool, "bad"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn tool_defaults_missing_schema() {
        let tool = tool("plain", Some("no arguments"), Value::Null).unwrap();
        let schema = serde_json::to_value(&tool.input_schema).unwrap();
        assert_eq!(schema["type"], "object");
    }
}

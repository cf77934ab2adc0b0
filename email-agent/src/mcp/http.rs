//! Streamable HTTP transport: JSON-RPC over POST, answered as JSON or SSE.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rust_mcp_schema::schema_utils::{ClientMessage, RequestFromClient, ServerMessage};
use rust_mcp_schema::{CallToolResult, ListToolsResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::protocol;
use super::{MCPError, MCPServerConfig, ToolOutput, ToolSession};

const JSON_CONTENT_TYPE: &str = "application/json";
const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const SESSION_ID_HEADER: &str = "mcp-session-id";
const CONNECT_TIMEOUT_SECONDS: u64 = 10;

pub struct StreamableHttpSession {
    server: String,
    url: String,
    client: reqwest::Client,
    headers: HashMap<String, String>,
    session_id: Option<String>,
    protocol_version: String,
    next_id: AtomicI64,
}

impl StreamableHttpSession {
    /// Runs the initialize handshake; the session is usable once this returns.
    pub async fn connect(server: &str, config: &MCPServerConfig) -> Result<Self, MCPError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| MCPError::ConfigError(format!("Server {server} has no url")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS))
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;

        let mut session = Self {
            server: server.to_string(),
            url,
            client,
            headers: config.headers.clone(),
            session_id: None,
            protocol_version: protocol::LATEST_PROTOCOL_VERSION.to_string(),
            next_id: AtomicI64::new(0),
        };

        let (response, session_id) = session
            .exchange(RequestFromClient::InitializeRequest(protocol::client_details()))
            .await
            .map_err(|e| match e {
                MCPError::ConnectionFailed(_) | MCPError::Timeout(_) => e,
                other => MCPError::ConnectionFailed(other.to_string()),
            })?;
        let initialized = protocol::parse_initialize_result(response)?;
        session.session_id = session_id;
        session.protocol_version = initialized.protocol_version;
        debug!(
            server = %session.server,
            remote = %initialized.server_info.name,
            protocol = %session.protocol_version,
            session_id = ?session.session_id,
            "MCP HTTP session initialized"
        );

        session.notify(protocol::initialized_message()?).await?;
        Ok(session)
    }

    fn post(&self, body: String) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", JSON_CONTENT_TYPE)
            .header("Accept", JSON_AND_SSE_ACCEPT)
            .header(PROTOCOL_VERSION_HEADER, &self.protocol_version)
            .body(body);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        request
    }

    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, MCPError> {
        let (reply, _) = self.exchange(request).await?;
        Ok(reply)
    }

    /// Sends one request and returns its reply plus any session id the server issued.
    async fn exchange(
        &self,
        request: RequestFromClient,
    ) -> Result<(ServerMessage, Option<String>), MCPError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = protocol::request_message(id, request)?;
        let body =
            serde_json::to_string(&message).map_err(|e| MCPError::ProtocolError(e.to_string()))?;
        debug!(server = %self.server, id, "Sending MCP HTTP request");

        let response = self.post(body).send().await.map_err(map_send_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(MCPError::ConnectionFailed(format!(
                "{} returned HTTP {status} for request {id}",
                self.server
            )));
        }

        let session_id = header_value(&response, SESSION_ID_HEADER);
        let content_type = header_value(&response, reqwest::header::CONTENT_TYPE.as_str())
            .unwrap_or_default();

        let reply = if is_event_stream_content_type(&content_type) {
            let mut messages = Box::pin(sse_messages(self.server.clone(), response));
            let mut matched = None;
            while let Some(message) = messages.next().await {
                let message = message?;
                if protocol::is_reply_to(&message, id) {
                    matched = Some(message);
                    break;
                }
                debug!(server = %self.server, "Skipping unrelated event stream message");
            }
            matched.ok_or_else(|| {
                MCPError::ProtocolError(format!("Event stream ended without a reply to request {id}"))
            })?
        } else {
            let bytes = response.bytes().await.map_err(map_send_error)?;
            serde_json::from_slice::<ServerMessage>(&bytes)
                .map_err(|e| MCPError::ProtocolError(e.to_string()))?
        };

        Ok((reply, session_id))
    }

    async fn notify(&self, message: ClientMessage) -> Result<(), MCPError> {
        let body =
            serde_json::to_string(&message).map_err(|e| MCPError::ProtocolError(e.to_string()))?;
        let response = self.post(body).send().await.map_err(map_send_error)?;
        if !response.status().is_success() {
            return Err(MCPError::ConnectionFailed(format!(
                "{} returned HTTP {} for a notification",
                self.server,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ToolSession for StreamableHttpSession {
    fn server_name(&self) -> &str {
        &self.server
    }

    async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult, MCPError> {
        let reply = self.request(protocol::list_tools_request(cursor)).await?;
        protocol::parse_list_tools(reply)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, MCPError> {
        let reply = self
            .request(protocol::call_tool_request(name, arguments)?)
            .await?;
        let result: CallToolResult = protocol::parse_response(reply)?;
        Ok(result.into())
    }

    async fn close(&self) -> Result<(), MCPError> {
        let Some(session_id) = &self.session_id else {
            return Ok(());
        };
        let response = self
            .client
            .delete(&self.url)
            .header(SESSION_ID_HEADER, session_id)
            .header(PROTOCOL_VERSION_HEADER, &self.protocol_version)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            debug!(server = %self.server, "MCP HTTP session terminated");
            Ok(())
        } else {
            warn!(server = %self.server, %status, "MCP HTTP session termination rejected");
            Err(MCPError::ConnectionFailed(format!(
                "{} returned HTTP {status} on session close",
                self.server
            )))
        }
    }
}

fn map_send_error(error: reqwest::Error) -> MCPError {
    if error.is_timeout() {
        MCPError::Timeout(error.to_string())
    } else {
        MCPError::ConnectionFailed(error.to_string())
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Decodes every `data:` line of an event stream into a server message.
///
/// Payloads that are not valid MCP messages are logged and skipped.
fn sse_messages(
    server: String,
    response: reqwest::Response,
) -> impl Stream<Item = Result<ServerMessage, MCPError>> + Send {
    async_stream::stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer = SseLineBuffer::default();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for line in buffer.push(&chunk) {
                        if let Some(message) = decode_sse_line(&server, &line) {
                            yield Ok(message);
                        }
                    }
                }
                Err(e) => {
                    yield Err(map_send_error(e));
                    return;
                }
            }
        }

        for line in buffer.finish() {
            if let Some(message) = decode_sse_line(&server, &line) {
                yield Ok(message);
            }
        }
    }
}

fn decode_sse_line(server: &str, line: &str) -> Option<ServerMessage> {
    let payload = sse_data_payload(line)?;
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_str::<ServerMessage>(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            debug!(server = %server, error = %e, "Ignoring undecodable event stream data");
            None
        }
    }
}

/// Reassembles newline-terminated lines across arbitrary chunk boundaries.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let newline = start + offset;
            if let Ok(text) = std::str::from_utf8(&self.buffer[start..newline]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            start = newline + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[start..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if start > 0 {
            self.buffer.drain(..start);
        }

        lines
    }
}

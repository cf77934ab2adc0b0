//! Stdio transport: newline-delimited JSON-RPC over a child process's pipes.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use rust_mcp_schema::schema_utils::{ClientMessage, RequestFromClient, ServerMessage};
use rust_mcp_schema::{CallToolResult, ListToolsResult, RequestId};

use super::protocol;
use super::{MCPError, MCPServerConfig, ToolOutput, ToolSession};

const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(3);

type PendingReplies = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct StdioSession {
    server: String,
    writer: Mutex<Option<BoxedWriter>>,
    pending: PendingReplies,
    next_id: AtomicI64,
    timeout: Duration,
    child: Mutex<Option<Child>>,
    reader: JoinHandle<()>,
}

impl StdioSession {
    /// Launches the configured command and initializes a session over its stdio.
    pub async fn spawn(server: &str, config: &MCPServerConfig) -> Result<Self, MCPError> {
        let program = config
            .command
            .as_deref()
            .ok_or_else(|| MCPError::ConfigError(format!("Server {server} has no command")))?;

        let mut child = Command::new(program)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MCPError::ConnectionFailed(format!("Failed to start {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MCPError::ConnectionFailed("Child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MCPError::ConnectionFailed("Child stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            let label = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %label, "stderr: {line}");
                }
            });
        }

        let session = Self::start(server, stdout, Box::new(stdin), Some(child), config.request_timeout());
        session.initialize().await?;
        Ok(session)
    }

    /// Initializes a session over already-connected streams.
    pub async fn from_streams<R, W>(
        server: &str,
        reader: R,
        writer: W,
        timeout: Duration,
    ) -> Result<Self, MCPError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session = Self::start(server, reader, Box::new(writer), None, timeout);
        session.initialize().await?;
        Ok(session)
    }

    fn start<R>(
        server: &str,
        reader: R,
        writer: BoxedWriter,
        child: Option<Child>,
        timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_replies(
            server.to_string(),
            reader,
            Arc::clone(&pending),
        ));

        Self {
            server: server.to_string(),
            writer: Mutex::new(Some(writer)),
            pending,
            next_id: AtomicI64::new(0),
            timeout,
            child: Mutex::new(child),
            reader,
        }
    }

    async fn initialize(&self) -> Result<(), MCPError> {
        let reply = self
            .request(RequestFromClient::InitializeRequest(protocol::client_details()))
            .await
            .map_err(|e| match e {
                MCPError::Timeout(_) | MCPError::ConnectionFailed(_) => e,
                other => MCPError::ConnectionFailed(other.to_string()),
            })?;
        let initialized = protocol::parse_initialize_result(reply)?;
        debug!(
            server = %self.server,
            remote = %initialized.server_info.name,
            protocol = %initialized.protocol_version,
            "MCP stdio session initialized"
        );
        self.send(&protocol::initialized_message()?).await
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), MCPError> {
        let mut line =
            serde_json::to_string(message).map_err(|e| MCPError::ProtocolError(e.to_string()))?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(MCPError::SessionClosed(self.server.clone()));
        };
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| MCPError::ConnectionFailed(e.to_string()))
    }

    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, MCPError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let key = RequestId::Integer(id);
        let message = protocol::request_message(id, request)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        if let Err(e) = self.send(&message).await {
            self.pending.lock().await.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MCPError::SessionClosed(self.server.clone())),
            Err(_) => {
                self.pending.lock().await.remove(&key);
                Err(MCPError::Timeout(format!(
                    "request {id} on {} after {}s",
                    self.server,
                    self.timeout.as_secs()
                )))
            }
        }
    }
}

/// Routes reply frames to their waiting requests until the stream ends.
async fn read_replies<R>(server: String, reader: R, pending: PendingReplies)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = LinesStream::new(BufReader::new(reader).lines());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(server = %server, error = %e, "Failed to read from MCP server");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message: ServerMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                debug!(server = %server, error = %e, "Ignoring non-JSON-RPC output");
                continue;
            }
        };
        match protocol::reply_id(&message).cloned() {
            Some(id) => {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(message);
                }
            }
            None => debug!(server = %server, "Ignoring unsolicited MCP frame"),
        }
    }
    // Dropping the senders fails every outstanding request.
    pending.lock().await.clear();
    debug!(server = %server, "MCP stdio stream closed");
}

#[async_trait]
impl ToolSession for StdioSession {
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
        // Closing stdin asks the server to exit.
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(EXIT_GRACE_PERIOD, child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.server, %status, "MCP server exited"),
                Ok(Err(e)) => warn!(server = %self.server, error = %e, "Failed to wait for MCP server"),
                Err(_) => {
                    warn!(server = %self.server, "MCP server did not exit, killing it");
                    child
                        .kill()
                        .await
                        .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;
                }
            }
        }

        self.reader.abort();
        self.pending.lock().await.clear();
        Ok(())
    }
}

impl Drop for StdioSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::server;
    use crate::tools::{ToolManager, weather::WeatherTool};
    use serde_json::json;

    async fn session_against_local_server() -> StdioSession {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        tokio::spawn(async move {
            let mut tools = ToolManager::new();
            tools.register(Box::new(WeatherTool::new()));
            let _ = server::serve(&tools, BufReader::new(server_read), server_write).await;
        });

        let (client_read, client_write) = tokio::io::split(client_side);
        StdioSession::from_streams("local", client_read, client_write, Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lists_and_calls_tools_over_streams() {
        let session = session_against_local_server().await;

        let tools = session.list_tools(None).await.unwrap();
        assert_eq!(tools.tools.len(), 1);
        assert_eq!(tools.tools[0].name, "get_weather_for_location");

        let output = session
            .call_tool("get_weather_for_location", json!({"location": "Lisbon"}))
            .await
            .unwrap();
        assert!(!output.is_error);
        assert!(output.text.contains("Lisbon"));

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_tool_is_a_tool_error() {
        let session = session_against_local_server().await;

        let output = session.call_tool("no_such_tool", json!({})).await.unwrap();
        assert!(output.is_error);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_after_close_fail() {
        let session = session_against_local_server().await;
        session.close().await.unwrap();

        let result = session.list_tools(None).await;
        assert!(matches!(result, Err(MCPError::SessionClosed(_))));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (client_side, _server_side) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_side);

        let result =
            StdioSession::from_streams("silent", client_read, client_write, Duration::from_millis(50))
                .await;
        assert!(matches!(result, Err(MCPError::Timeout(_))));
    }
}

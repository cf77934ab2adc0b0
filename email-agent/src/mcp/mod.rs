use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{Map, serde_as};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub mod http;
pub mod protocol;
pub mod server;
pub mod stdio;

use http::StreamableHttpSession;
use rust_mcp_schema::{CallToolResult, ListToolsResult, Tool};
use stdio::StdioSession;

/// Upper bound on `tools/list` pages followed for one server.
const MAX_TOOL_PAGES: usize = 100;
const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    #[serde(alias = "streamable-http", alias = "http")]
    StreamableHttp,
    Stdio,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MCPServerConfig {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: u64,
}

impl MCPServerConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        let seconds = if self.timeout_seconds == 0 {
            DEFAULT_TIMEOUT_SECONDS
        } else {
            self.timeout_seconds
        };
        std::time::Duration::from_secs(seconds)
    }

    /// Short human-readable target: the URL for HTTP, the command line for stdio.
    pub fn endpoint(&self) -> String {
        match self.transport {
            TransportKind::StreamableHttp => self.url.clone().unwrap_or_else(|| "unknown".to_string()),
            TransportKind::Stdio => {
                let mut parts = vec![self.command.clone().unwrap_or_else(|| "unknown".to_string())];
                parts.extend(self.args.iter().cloned());
                parts.join(" ")
            }
        }
    }
}

/// Configured tool servers, in document order.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MCPConfig {
    #[serde_as(as = "Map<_, _>")]
    #[serde(default)]
    pub servers: Vec<(String, MCPServerConfig)>,
}

impl MCPConfig {
    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&MCPServerConfig> {
        self.servers
            .iter()
            .find(|(server, _)| server == name)
            .map(|(_, config)| config)
    }

    /// At most one session per name, so names must be unique.
    pub fn validate(&self) -> Result<(), MCPError> {
        let mut seen = HashSet::new();
        for (name, config) in &self.servers {
            if !seen.insert(name.as_str()) {
                return Err(MCPError::ConfigError(format!("Duplicate server name: {name}")));
            }
            match config.transport {
                TransportKind::StreamableHttp if config.url.is_none() => {
                    return Err(MCPError::ConfigError(format!(
                        "Server {name} uses streamable_http but has no url"
                    )));
                }
                TransportKind::Stdio if config.command.is_none() => {
                    return Err(MCPError::ConfigError(format!(
                        "Server {name} uses stdio but has no command"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MCPError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Server not found: {0}")]
    ServerNotFound(String),
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Malformed tool schema for {tool}: {reason}")]
    MalformedSchema { tool: String, reason: String },
    #[error("Session closed: {0}")]
    SessionClosed(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// One entry of the aggregated tool catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn definition(&self) -> crate::clients::ToolDefinition {
        crate::clients::ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }
}

/// Text rendering of a `tools/call` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl From<CallToolResult> for ToolOutput {
    fn from(result: CallToolResult) -> Self {
        Self {
            text: protocol::flatten_text(&result),
            is_error: result.is_error.unwrap_or(false),
        }
    }
}

/// An open connection to one named tool server.
#[async_trait]
pub trait ToolSession: Send + Sync {
    fn server_name(&self) -> &str;

    async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult, MCPError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, MCPError>;

    async fn close(&self) -> Result<(), MCPError>;
}

/// Opens sessions by configured server name.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn open(&self, server: &str) -> Result<Box<dyn ToolSession>, MCPError>;
}

/// Fetches every page of a server's tool list and validates each entry.
pub async fn load_catalog(session: &dyn ToolSession) -> Result<Vec<ToolDescriptor>, MCPError> {
    let server = session.server_name().to_string();
    let mut descriptors = Vec::new();
    let mut cursor = None;

    for _ in 0..MAX_TOOL_PAGES {
        let page = session.list_tools(cursor.take()).await?;
        for tool in page.tools {
            descriptors.push(describe(&server, tool)?);
        }
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => {
                debug!(server = %server, tools = descriptors.len(), "Loaded tool catalog");
                return Ok(descriptors);
            }
        }
    }

    Err(MCPError::ProtocolError(format!(
        "{server} returned more than {MAX_TOOL_PAGES} tool pages"
    )))
}

fn describe(server: &str, tool: Tool) -> Result<ToolDescriptor, MCPError> {
    if tool.name.trim().is_empty() {
        return Err(MCPError::MalformedSchema {
            tool: "<unnamed>".to_string(),
            reason: "tool name is empty".to_string(),
        });
    }
    let input_schema =
        serde_json::to_value(&tool.input_schema).map_err(|e| MCPError::MalformedSchema {
            tool: tool.name.clone(),
            reason: e.to_string(),
        })?;
    if input_schema.get("type").and_then(Value::as_str) != Some("object") {
        return Err(MCPError::MalformedSchema {
            tool: tool.name,
            reason: format!("input schema must describe an object, got {input_schema}"),
        });
    }
    Ok(ToolDescriptor {
        server: server.to_string(),
        description: tool.description.unwrap_or_default(),
        name: tool.name,
        input_schema,
    })
}

/// Connector backed by the transports in this module.
pub struct McpConnector {
    config: MCPConfig,
}

impl McpConnector {
    pub fn new(config: MCPConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionConnector for McpConnector {
    async fn open(&self, server: &str) -> Result<Box<dyn ToolSession>, MCPError> {
        let config = self
            .config
            .get(server)
            .ok_or_else(|| MCPError::ServerNotFound(server.to_string()))?;

        info!(server = %server, transport = ?config.transport, endpoint = %config.endpoint(), "Opening MCP session");
        match config.transport {
            TransportKind::StreamableHttp => {
                let session = StreamableHttpSession::connect(server, config).await?;
                Ok(Box::new(session))
            }
            TransportKind::Stdio => {
                let session = StdioSession::spawn(server, config).await?;
                Ok(Box::new(session))
            }
        }
    }
}

pub async fn load_mcp_config(config_path: &Path) -> Result<MCPConfig, MCPError> {
    if !config_path.exists() {
        return Ok(MCPConfig::default());
    }

    let content = tokio::fs::read_to_string(config_path)
        .await
        .map_err(|e| MCPError::ConfigError(e.to_string()))?;

    let config: MCPConfig =
        serde_json::from_str(&content).map_err(|e| MCPError::ConfigError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct PagedSession {
        pages: Mutex<Vec<ListToolsResult>>,
    }

    #[async_trait]
    impl ToolSession for PagedSession {
        fn server_name(&self) -> &str {
            "paged"
        }

        async fn list_tools(&self, _cursor: Option<String>) -> Result<ListToolsResult, MCPError> {
            let mut pages = self.pages.lock().unwrap();
            Ok(pages.remove(0))
        }

        async fn call_tool(&self, name: &str, _arguments: Value) -> Result<ToolOutput, MCPError> {
            Err(MCPError::UnknownTool(name.to_string()))
        }

        async fn close(&self) -> Result<(), MCPError> {
            Ok(())
        }
    }

    fn tool(name: &str, schema: Value) -> Tool {
        protocol::tool(name, Some(&format!("{name} tool")), schema).unwrap()
    }

    fn page(tools: Vec<Tool>, next_cursor: Option<&str>) -> ListToolsResult {
        ListToolsResult {
            meta: None,
            next_cursor: next_cursor.map(str::to_string),
            tools,
        }
    }

    #[test]
    fn test_config_keeps_document_order() {
        let config: MCPConfig = serde_json::from_value(json!({
            "servers": {
                "zeta": {"transport": "streamable_http", "url": "http://127.0.0.1:8000/mcp"},
                "alpha": {"transport": "stdio", "command": "email-agent", "args": ["serve-tools"]},
                "mid": {"url": "http://127.0.0.1:8400/mcp"}
            }
        }))
        .unwrap();

        assert_eq!(config.server_names(), vec!["zeta", "alpha", "mid"]);
        assert_eq!(config.get("mid").unwrap().transport, TransportKind::StreamableHttp);
        assert_eq!(config.get("alpha").unwrap().endpoint(), "email-agent serve-tools");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_duplicates_and_missing_targets() {
        let duplicate = MCPConfig {
            servers: vec![
                ("a".to_string(), MCPServerConfig { url: Some("http://x".into()), ..Default::default() }),
                ("a".to_string(), MCPServerConfig { url: Some("http://y".into()), ..Default::default() }),
            ],
        };
        assert!(matches!(duplicate.validate(), Err(MCPError::ConfigError(_))));

        let no_command = MCPConfig {
            servers: vec![(
                "local".to_string(),
                MCPServerConfig { transport: TransportKind::Stdio, ..Default::default() },
            )],
        };
        assert!(no_command.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_mcp_config_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_mcp_config(&dir.path().join("absent.json")).await.unwrap();
        assert!(config.servers.is_empty());
    }

    #[tokio::test]
    async fn test_load_catalog_follows_cursors() {
        let session = PagedSession {
            pages: Mutex::new(vec![
                page(vec![tool("x", json!({"type": "object"}))], Some("2")),
                page(vec![tool("y", Value::Null), tool("z", json!({"type": "object"}))], None),
            ]),
        };

        let catalog = load_catalog(&session).await.unwrap();

        let names: Vec<_> = catalog.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y", "z"]);
        assert!(catalog.iter().all(|t| t.server == "paged"));
        assert_eq!(catalog[1].input_schema["type"], "object");
        assert_eq!(catalog[0].description, "x tool");
    }

    #[tokio::test]
    async fn test_load_catalog_rejects_unnamed_tool() {
        let session = PagedSession {
            pages: Mutex::new(vec![page(vec![tool("ok", Value::Null), tool(" ", Value::Null)], None)]),
        };

        match load_catalog(&session).await {
            Err(MCPError::MalformedSchema { tool, .. }) => assert_eq!(tool, "<unnamed>"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_tool_output_flattens_call_result() {
        let result = protocol::text_result("done", true).unwrap();
        let output = ToolOutput::from(result);
        assert_eq!(output.text, "done");
        assert!(output.is_error);
    }
}

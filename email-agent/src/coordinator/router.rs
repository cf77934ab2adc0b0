use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::core::ToolExecutor;
use crate::mcp::{MCPError, ToolDescriptor, ToolOutput};

/// A tool call handed to the session task, answered on `reply`.
pub(crate) struct ToolCallRequest {
    pub(crate) server: String,
    pub(crate) tool: String,
    pub(crate) arguments: Value,
    pub(crate) reply: oneshot::Sender<Result<ToolOutput, MCPError>>,
}

/// Maps tool names to the server that advertised them.
///
/// The first server to advertise a name wins; later duplicates are unreachable.
pub(crate) struct ToolRouter {
    routes: HashMap<String, String>,
    calls: mpsc::Sender<ToolCallRequest>,
}

impl ToolRouter {
    pub(crate) fn new(catalog: &[ToolDescriptor], calls: mpsc::Sender<ToolCallRequest>) -> Self {
        let mut routes = HashMap::new();
        for tool in catalog {
            if let Some(owner) = routes.get(&tool.name) {
                warn!(
                    tool = %tool.name,
                    server = %tool.server,
                    owner = %owner,
                    "Duplicate tool name, keeping the first server"
                );
                continue;
            }
            routes.insert(tool.name.clone(), tool.server.clone());
        }
        Self { routes, calls }
    }
}

#[async_trait]
impl ToolExecutor for ToolRouter {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, MCPError> {
        let server = self
            .routes
            .get(name)
            .ok_or_else(|| MCPError::UnknownTool(name.to_string()))?;

        let (reply, response) = oneshot::channel();
        self.calls
            .send(ToolCallRequest {
                server: server.clone(),
                tool: name.to_string(),
                arguments,
                reply,
            })
            .await
            .map_err(|_| MCPError::SessionClosed(server.clone()))?;

        response
            .await
            .map_err(|_| MCPError::SessionClosed(server.clone()))?
    }
}

use futures::Future;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use crate::clients::LLMClient;

pub mod classify;
pub mod orders;
pub mod weather;

use classify::{Classifier, ClassifyMessageTool, GetClassificationsTool};
use orders::{OrderStore, SaveOrderTool, VerifyOrderTool};
use weather::WeatherTool;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ToolError {
    fn from(error: std::io::Error) -> Self {
        ToolError::IoError(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;

pub trait ToolTrait: Send + Sync {
    fn info(&self) -> ToolInfo;
    fn execute(&self, arguments: Value) -> ToolFuture;
}

pub(crate) fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{key}' argument")))
}

/// Registered tools in registration order.
#[derive(Default)]
pub struct ToolManager {
    tools: Vec<Box<dyn ToolTrait>>,
}

impl ToolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a name twice replaces the earlier tool in place.
    pub fn register(&mut self, tool: Box<dyn ToolTrait>) {
        let name = tool.info().name;
        match self.tools.iter().position(|t| t.info().name == name) {
            Some(index) => self.tools[index] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolTrait> {
        self.tools
            .iter()
            .find(|t| t.info().name == name)
            .map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.info().name).collect()
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|t| t.info()).collect()
    }
}

/// Inputs for the built-in tool server.
pub struct ToolSettings {
    pub orders_dir: PathBuf,
    pub classification_dir: PathBuf,
    pub llm: Option<Arc<dyn LLMClient>>,
}

pub async fn email_tools(settings: ToolSettings) -> Result<ToolManager, ToolError> {
    let mut manager = ToolManager::new();

    let classifier = Arc::new(Classifier::load(&settings.classification_dir, settings.llm).await?);
    manager.register(Box::new(ClassifyMessageTool::new(Arc::clone(&classifier))));
    manager.register(Box::new(GetClassificationsTool::new(classifier)));

    let store = Arc::new(OrderStore::new(settings.orders_dir));
    manager.register(Box::new(SaveOrderTool::new(Arc::clone(&store))));
    manager.register(Box::new(VerifyOrderTool::new(store)));

    manager.register(Box::new(WeatherTool::new()));

    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_email_tools_registers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = email_tools(ToolSettings {
            orders_dir: dir.path().join("orders"),
            classification_dir: dir.path().join("classification"),
            llm: None,
        })
        .await
        .unwrap();

        assert_eq!(
            manager.list(),
            vec![
                "classify_message",
                "get_classifications",
                "save_order",
                "verify_order",
                "get_weather_for_location",
            ]
        );
        assert_eq!(manager.infos().len(), 5);
        assert!(manager.get("read_file").is_none());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut manager = ToolManager::new();
        manager.register(Box::new(WeatherTool::new()));
        manager.register(Box::new(WeatherTool::new()));

        assert_eq!(manager.list().len(), 1);
    }

    #[test]
    fn test_required_str() {
        let args = json!({"order_id": "abc", "count": 3});
        assert_eq!(required_str(&args, "order_id").unwrap(), "abc");
        assert!(matches!(
            required_str(&args, "count"),
            Err(ToolError::InvalidArguments(_))
        ));
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::{ToolError, ToolFuture, ToolInfo, ToolTrait, required_str};

const ORDER_ID_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.6f";
const MAX_ID_SUFFIX: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub item: Vec<Item>,
    pub customer_name: String,
    pub address: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub order_path: String,
    pub order_id: String,
    pub success: bool,
}

/// Orders persisted as one JSON file per order.
pub struct OrderStore {
    dir: PathBuf,
}

impl OrderStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub async fn save(&self, order: &Order) -> Result<OrderConfirmation, ToolError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_string(order)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let base = chrono::Local::now().format(ORDER_ID_FORMAT).to_string();
        for attempt in 0..MAX_ID_SUFFIX {
            let order_id = if attempt == 0 {
                base.clone()
            } else {
                format!("{base}-{attempt}")
            };
            let path = self.dir.join(format!("{order_id}.json"));

            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            let mut file = match file {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };
            tokio::io::AsyncWriteExt::write_all(&mut file, body.as_bytes()).await?;
            tokio::io::AsyncWriteExt::flush(&mut file).await?;

            info!(order_id = %order_id, customer = %order.customer_name, "Saved order");
            return Ok(OrderConfirmation {
                order_path: path.to_string_lossy().replace('\\', "/"),
                success: tokio::fs::try_exists(&path).await.unwrap_or(false),
                order_id,
            });
        }

        Err(ToolError::ExecutionFailed(format!(
            "No free order id for timestamp {base}"
        )))
    }

    pub async fn verify(&self, order_id: &str) -> bool {
        let order_id = order_id.trim();
        if order_id.is_empty()
            || order_id.contains(['/', '\\'])
            || order_id.contains("..")
        {
            return false;
        }
        let path = self.dir.join(format!("{order_id}.json"));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<Order>(&content).is_ok(),
            Err(_) => false,
        }
    }
}

pub struct SaveOrderTool {
    store: Arc<OrderStore>,
}

impl SaveOrderTool {
    pub fn new(store: Arc<OrderStore>) -> Self {
        Self { store }
    }
}

impl ToolTrait for SaveOrderTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "save_order".to_string(),
            description: "Save a customer order and return its confirmation".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "order": {
                        "type": "object",
                        "properties": {
                            "item": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "name": {"type": "string"},
                                        "quantity": {"type": "integer"}
                                    },
                                    "required": ["name", "quantity"]
                                }
                            },
                            "customer_name": {"type": "string"},
                            "address": {"type": "string"},
                            "email": {"type": "string"}
                        },
                        "required": ["item", "customer_name", "address", "email"]
                    }
                },
                "required": ["order"]
            }),
        }
    }

    fn execute(&self, arguments: Value) -> ToolFuture {
        let store = Arc::clone(&self.store);
        Box::pin(async move {
            // Accept the order either wrapped under "order" or as the bare object.
            let raw = arguments.get("order").cloned().unwrap_or(arguments);
            let order: Order = serde_json::from_value(raw)
                .map_err(|e| ToolError::InvalidArguments(format!("Invalid order: {e}")))?;
            let confirmation = store.save(&order).await?;
            serde_json::to_value(confirmation).map_err(|e| ToolError::ExecutionFailed(e.to_string()))
        })
    }
}

pub struct VerifyOrderTool {
    store: Arc<OrderStore>,
}

impl VerifyOrderTool {
    pub fn new(store: Arc<OrderStore>) -> Self {
        Self { store }
    }
}

impl ToolTrait for VerifyOrderTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "verify_order".to_string(),
            description: "Check whether an order with the given id exists".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "order_id": {
                        "type": "string",
                        "description": "Id returned by save_order"
                    }
                },
                "required": ["order_id"]
            }),
        }
    }

    fn execute(&self, arguments: Value) -> ToolFuture {
        let store = Arc::clone(&self.store);
        Box::pin(async move {
            let order_id = required_str(&arguments, "order_id")?;
            Ok(Value::Bool(store.verify(order_id).await))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn order() -> Order {
        Order {
            item: vec![Item {
                name: "Widget".to_string(),
                quantity: 2,
            }],
            customer_name: "Sam Doe".to_string(),
            address: "1 Main St".to_string(),
            email: "sam@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_creates_directory_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path().join("downloads").join("sales_orders"));

        let confirmation = store.save(&order()).await.unwrap();

        assert!(confirmation.success);
        assert!(!confirmation.order_id.contains(':'));
        assert!(confirmation.order_path.ends_with(&format!("{}.json", confirmation.order_id)));
        assert!(store.verify(&confirmation.order_id).await);
        assert!(!store.verify("2020-01-01T00-00-00.000000").await);
    }

    #[tokio::test]
    async fn test_rapid_saves_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path().to_path_buf());

        let first = store.save(&order()).await.unwrap();
        let second = store.save(&order()).await.unwrap();

        assert_ne!(first.order_id, second.order_id);
        assert!(store.verify(&second.order_id).await);
    }

    #[rstest]
    #[case("")]
    #[case("../secret")]
    #[case("nested/order")]
    #[case("a\\b")]
    #[tokio::test]
    async fn test_verify_rejects_path_like_ids(#[case] order_id: &str) {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path().to_path_buf());

        assert!(!store.verify(order_id).await);
    }

    #[tokio::test]
    async fn test_verify_rejects_unparseable_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("junk.json"), "{}").await.unwrap();
        let store = OrderStore::new(dir.path().to_path_buf());

        assert!(!store.verify("junk").await);
    }

    #[tokio::test]
    async fn test_tools_accept_wrapped_and_bare_orders() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OrderStore::new(dir.path().to_path_buf()));
        let save = SaveOrderTool::new(Arc::clone(&store));
        let verify = VerifyOrderTool::new(store);

        let wrapped = save
            .execute(json!({"order": serde_json::to_value(order()).unwrap()}))
            .await
            .unwrap();
        let bare = save.execute(serde_json::to_value(order()).unwrap()).await.unwrap();
        assert_eq!(wrapped["success"], true);
        assert_eq!(bare["success"], true);

        let found = verify
            .execute(json!({"order_id": wrapped["order_id"]}))
            .await
            .unwrap();
        assert_eq!(found, Value::Bool(true));

        let invalid = save.execute(json!({"order": {"item": []}})).await;
        assert!(matches!(invalid, Err(ToolError::InvalidArguments(_))));
    }
}

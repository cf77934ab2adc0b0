use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{ToolError, ToolFuture, ToolInfo, ToolTrait, required_str};
use crate::clients::{LLMClient, Message};
use crate::prompts;

pub const FALLBACK_CATEGORY: &str = "Other";
pub const CATEGORIES_FILE: &str = "classification.json";
pub const PROMPT_FILE: &str = "system_prompt.md";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Category {
    pub category: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default)]
    pub reason: String,
    pub category: String,
}

fn default_categories() -> Vec<Category> {
    [
        ("Order", "The sender wants to place a new order"),
        ("Order Status", "The sender asks about an existing order"),
        ("Support", "The sender reports a problem or needs help with a product"),
        (FALLBACK_CATEGORY, "Anything that fits none of the other categories"),
    ]
    .into_iter()
    .map(|(category, description)| Category {
        category: category.to_string(),
        description: description.to_string(),
    })
    .collect()
}

/// Email classifier backed by one structured model call per message.
pub struct Classifier {
    categories: Vec<Category>,
    system_prompt: String,
    llm: Option<Arc<dyn LLMClient>>,
}

impl Classifier {
    pub fn new(
        categories: Vec<Category>,
        system_prompt: String,
        llm: Option<Arc<dyn LLMClient>>,
    ) -> Self {
        Self {
            categories,
            system_prompt,
            llm,
        }
    }

    /// Reads `classification.json` and `system_prompt.md` from `dir`, using built-in defaults for missing files.
    pub async fn load(dir: &Path, llm: Option<Arc<dyn LLMClient>>) -> Result<Self, ToolError> {
        let categories_path = dir.join(CATEGORIES_FILE);
        let categories = if categories_path.exists() {
            let content = tokio::fs::read_to_string(&categories_path).await?;
            serde_json::from_str::<Vec<Category>>(&content).map_err(|e| {
                ToolError::ExecutionFailed(format!(
                    "Invalid categories in {}: {e}",
                    categories_path.display()
                ))
            })?
        } else {
            debug!(path = %categories_path.display(), "Using built-in categories");
            default_categories()
        };

        let prompt_path = dir.join(PROMPT_FILE);
        let system_prompt = if prompt_path.exists() {
            tokio::fs::read_to_string(&prompt_path).await?
        } else {
            prompts::DEFAULT_CLASSIFICATION_PROMPT.to_string()
        };

        Ok(Self::new(categories, system_prompt, llm))
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub async fn classify(&self, message: &str) -> Result<Classification, ToolError> {
        let message = message.trim();
        if message.is_empty() {
            return Ok(Classification {
                reason: "The message is empty".to_string(),
                category: FALLBACK_CATEGORY.to_string(),
            });
        }
        let llm = self.llm.as_ref().ok_or_else(|| {
            ToolError::ExecutionFailed("No model configured for classification".to_string())
        })?;

        let request = vec![
            Message::system(prompts::build_classification_prompt(
                &self.system_prompt,
                &self.categories,
            )),
            Message::user(prompts::build_classification_request(message)),
        ];
        let reply = llm
            .complete(request, Vec::new())
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let mut classification = parse_classification(&reply.content)?;
        if !self
            .categories
            .iter()
            .any(|c| c.category == classification.category)
        {
            warn!(category = %classification.category, "Model returned an unknown category");
            classification.category = FALLBACK_CATEGORY.to_string();
        }
        debug!(category = %classification.category, "Classified message");
        Ok(classification)
    }
}

/// Parses the model's JSON answer, tolerating a surrounding code fence.
fn parse_classification(content: &str) -> Result<Classification, ToolError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| {
        ToolError::ExecutionFailed(format!("Unparseable classification '{trimmed}': {e}"))
    })
}

pub struct ClassifyMessageTool {
    classifier: Arc<Classifier>,
}

impl ClassifyMessageTool {
    pub fn new(classifier: Arc<Classifier>) -> Self {
        Self { classifier }
    }
}

impl ToolTrait for ClassifyMessageTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "classify_message".to_string(),
            description: "Classify an email message into one of the predefined categories"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "Full text of the email"
                    }
                },
                "required": ["message"]
            }),
        }
    }

    fn execute(&self, arguments: Value) -> ToolFuture {
        let classifier = Arc::clone(&self.classifier);
        Box::pin(async move {
            let message = required_str(&arguments, "message")?;
            let classification = classifier.classify(message).await?;
            Ok(Value::String(classification.category))
        })
    }
}

pub struct GetClassificationsTool {
    classifier: Arc<Classifier>,
}

impl GetClassificationsTool {
    pub fn new(classifier: Arc<Classifier>) -> Self {
        Self { classifier }
    }
}

impl ToolTrait for GetClassificationsTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "get_classifications".to_string(),
            description: "List the categories messages can be classified into".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    fn execute(&self, _arguments: Value) -> ToolFuture {
        let classifier = Arc::clone(&self.classifier);
        Box::pin(async move {
            serde_json::to_value(classifier.categories())
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{LLMError, ModelInfo, ToolDefinition};
    use async_trait::async_trait;
    use rstest::rstest;
    use std::sync::Mutex;

    struct ScriptedModel {
        reply: String,
        prompts: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedModel {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LLMClient for ScriptedModel {
        async fn complete(
            &self,
            messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
        ) -> Result<Message, LLMError> {
            self.prompts.lock().unwrap().push(messages);
            Ok(Message::assistant(self.reply.clone()))
        }

        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                name: "scripted".to_string(),
                max_tokens: None,
                supports_tools: false,
            }
        }
    }

    fn classifier(model: &Arc<ScriptedModel>) -> Classifier {
        let llm: Arc<dyn LLMClient> = Arc::clone(model) as Arc<dyn LLMClient>;
        Classifier::new(default_categories(), "Sort emails.".to_string(), Some(llm))
    }

    #[tokio::test]
    async fn test_blank_message_skips_the_model() {
        let model = ScriptedModel::new(r#"{"reason": "x", "category": "Order"}"#);
        let result = classifier(&model).classify("   \n").await.unwrap();

        assert_eq!(result.category, FALLBACK_CATEGORY);
        assert!(model.prompts.lock().unwrap().is_empty());
    }

    #[rstest]
    #[case(r#"{"reason": "wants widgets", "category": "Order"}"#, "Order")]
    #[case("```json\n{\"reason\": \"late\", \"category\": \"Order Status\"}\n```", "Order Status")]
    #[case(r#"{"reason": "?", "category": "Spam"}"#, FALLBACK_CATEGORY)]
    #[tokio::test]
    async fn test_classify_maps_model_answer(#[case] reply: &str, #[case] expected: &str) {
        let model = ScriptedModel::new(reply);
        let result = classifier(&model).classify("I'd like two widgets").await.unwrap();

        assert_eq!(result.category, expected);
        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0][0].content.contains("- **Order**:"));
        assert_eq!(prompts[0][1].content, "Email to classify:\nI'd like two widgets");
    }

    #[tokio::test]
    async fn test_unparseable_answer_is_an_error() {
        let model = ScriptedModel::new("Order, probably");
        assert!(classifier(&model).classify("hello").await.is_err());
    }

    #[tokio::test]
    async fn test_load_reads_files_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = Classifier::load(dir.path(), None).await.unwrap();
        assert_eq!(defaults.categories().len(), 4);

        tokio::fs::write(
            dir.path().join(CATEGORIES_FILE),
            r#"[{"category": "Billing", "description": "Invoices"}]"#,
        )
        .await
        .unwrap();
        tokio::fs::write(dir.path().join(PROMPT_FILE), "Custom prompt").await.unwrap();

        let loaded = Classifier::load(dir.path(), None).await.unwrap();
        assert_eq!(loaded.categories()[0].category, "Billing");
        assert_eq!(loaded.system_prompt, "Custom prompt");
        assert!(loaded.classify("hi").await.is_err());
    }

    #[tokio::test]
    async fn test_get_classifications_tool() {
        let model = ScriptedModel::new("{}");
        let tool = GetClassificationsTool::new(Arc::new(classifier(&model)));

        let listed = tool.execute(json!({})).await.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 4);
        assert_eq!(listed[3]["category"], FALLBACK_CATEGORY);
    }
}

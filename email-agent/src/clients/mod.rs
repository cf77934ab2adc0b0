use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const REQUEST_TIMEOUT_SECONDS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Tool calls requested by an assistant message, empty for every other role.
    pub fn requested_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub supports_tools: bool,
}

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Model handle shared by the agent and the classification tool.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Sends the conversation and returns the assistant reply, which may carry tool calls.
    async fn complete(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<Message, LLMError>;

    fn model_info(&self) -> ModelInfo;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    ApiKeyHeader,
}

pub struct OpenAIClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
    timeout: Duration,
    base_url: String,
    auth: AuthStyle,
}

impl OpenAIClient {
    pub fn new(api_key: String, model: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            model,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECONDS),
            base_url: base_url.unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
            auth: AuthStyle::Bearer,
        }
    }

    /// Azure deployments authenticate with an `api-key` header and need an explicit endpoint.
    pub fn azure(api_key: String, model: String, endpoint: String) -> Self {
        Self {
            auth: AuthStyle::ApiKeyHeader,
            ..Self::new(api_key, model, Some(endpoint))
        }
    }

    fn build_request(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<serde_json::Value, LLMError> {
        let messages_json: Vec<serde_json::Value> = messages
            .into_iter()
            .map(|msg| {
                let mut map = serde_json::Map::new();
                map.insert(
                    "role".to_string(),
                    serde_json::Value::String(match msg.role {
                        MessageRole::System => "system".to_string(),
                        MessageRole::User => "user".to_string(),
                        MessageRole::Assistant => "assistant".to_string(),
                        MessageRole::Tool => "tool".to_string(),
                    }),
                );
                map.insert("content".to_string(), serde_json::Value::String(msg.content));

                if let Some(tool_calls) = msg.tool_calls {
                    let tool_calls_json: Vec<serde_json::Value> = tool_calls
                        .into_iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.function.name,
                                    "arguments": tc.function.arguments
                                }
                            })
                        })
                        .collect();
                    map.insert(
                        "tool_calls".to_string(),
                        serde_json::Value::Array(tool_calls_json),
                    );
                }

                if let Some(id) = msg.tool_call_id {
                    map.insert("tool_call_id".to_string(), serde_json::Value::String(id));
                }

                serde_json::Value::Object(map)
            })
            .collect();

        if messages_json.is_empty() {
            return Err(LLMError::ConfigError("No messages to send".to_string()));
        }

        let mut request = serde_json::Map::new();
        request.insert("model".to_string(), serde_json::Value::String(self.model.clone()));
        request.insert("messages".to_string(), serde_json::Value::Array(messages_json));

        if !tools.is_empty() {
            let tools_json: Vec<serde_json::Value> = tools
                .into_iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters
                        }
                    })
                })
                .collect();
            request.insert("tools".to_string(), serde_json::Value::Array(tools_json));
        }

        Ok(serde_json::Value::Object(request))
    }
}

/// A tool call without an id or function name cannot be answered, so it fails the completion.
fn parse_tool_call(call: &serde_json::Value) -> Result<ToolCall, LLMError> {
    let id = call
        .get("id")
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| LLMError::ParseError(format!("Tool call without an id: {call}")))?;
    let function = call
        .get("function")
        .ok_or_else(|| LLMError::ParseError(format!("Tool call {id} has no function")))?;
    let name = function
        .get("name")
        .and_then(|name| name.as_str())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| LLMError::ParseError(format!("Tool call {id} has no function name")))?;
    Ok(ToolCall {
        id: id.to_string(),
        function: ToolFunction {
            name: name.to_string(),
            arguments: function
                .get("arguments")
                .and_then(|a| a.as_str())
                .unwrap_or("{}")
                .to_string(),
        },
    })
}

fn parse_completion(body: &serde_json::Value) -> Result<Message, LLMError> {
    if let Some(error) = body.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(LLMError::ApiError(message));
    }

    let message = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| LLMError::ParseError(format!("No choices in response: {body}")))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let tool_calls = match message.get("tool_calls") {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(calls)) => calls
            .iter()
            .map(parse_tool_call)
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(LLMError::ParseError(format!("tool_calls is not a list: {other}")));
        }
    };

    Ok(Message {
        role: MessageRole::Assistant,
        content,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    })
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn complete(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<Message, LLMError> {
        let request = self.build_request(messages, tools)?;
        debug!(model = %self.model, "Sending chat completion request");

        let builder = self
            .client
            .post(&self.base_url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json");
        let builder = match self.auth {
            AuthStyle::Bearer => builder.header("Authorization", format!("Bearer {}", self.api_key)),
            AuthStyle::ApiKeyHeader => builder.header("api-key", &self.api_key),
        };

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(|e| LLMError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;

        if !status.is_success() && body.get("error").is_none() {
            return Err(LLMError::ApiError(format!("HTTP {status}: {body}")));
        }

        parse_completion(&body)
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: self.model.clone(),
            max_tokens: Some(16384),
            supports_tools: true,
        }
    }
}

pub fn create_llm_client(
    provider: &str,
    api_key: String,
    model: String,
    base_url: Option<String>,
) -> Result<Box<dyn LLMClient>, LLMError> {
    match provider {
        "openai" | "OpenAI" => Ok(Box::new(OpenAIClient::new(api_key, model, base_url))),
        "azure" | "Azure" => {
            let endpoint = base_url.ok_or_else(|| {
                LLMError::ConfigError("Azure provider requires --base-url".to_string())
            })?;
            Ok(Box::new(OpenAIClient::azure(api_key, model, endpoint)))
        }
        _ => Err(LLMError::ConfigError(format!("Unknown provider: {}", provider))),
    }
}

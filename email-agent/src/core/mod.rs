use crate::clients::{LLMClient, LLMError, Message, ToolCall, ToolDefinition};
use crate::mcp::{MCPError, ToolDescriptor, ToolOutput};
use crate::prompts::build_agent_prompt;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_MAX_STEPS: usize = 25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub thought: String,
    pub action: String,
    pub action_input: Value,
    pub observation: String,
}

impl Step {
    pub fn new(thought: String, action: String, action_input: Value, observation: String) -> Self {
        Self {
            thought,
            action,
            action_input,
            observation,
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LLMError(#[from] LLMError),
    #[error("Tool error: {0}")]
    ToolError(#[from] MCPError),
    #[error("Max steps exceeded")]
    MaxStepsExceeded,
}

/// Result of one agent turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    /// The input history followed by every message produced this turn.
    pub messages: Vec<Message>,
    /// Final assistant answer.
    pub output: String,
    pub steps: Vec<Step>,
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, messages: Vec<Message>) -> Result<AgentResponse, AgentError>;
}

/// Executes a tool by name on whichever backend advertised it.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, MCPError>;
}

/// Builds a fresh agent bound to a tool catalog.
pub trait AgentBuilder: Send + Sync {
    fn build(&self, tools: Vec<ToolDescriptor>, executor: Arc<dyn ToolExecutor>) -> Arc<dyn Agent>;
}

pub type StepCallback = Arc<dyn Fn(usize, &Step) + Send + Sync>;

pub struct ReactAgent {
    client: Arc<dyn LLMClient>,
    tools: Vec<ToolDefinition>,
    executor: Arc<dyn ToolExecutor>,
    system_prompt: String,
    max_steps: usize,
    step_callback: Option<StepCallback>,
}

impl ReactAgent {
    pub fn new(
        client: Arc<dyn LLMClient>,
        tools: Vec<ToolDefinition>,
        executor: Arc<dyn ToolExecutor>,
        system_prompt: String,
        max_steps: Option<usize>,
        step_callback: Option<StepCallback>,
    ) -> Self {
        Self {
            client,
            tools,
            executor,
            system_prompt,
            max_steps: max_steps.unwrap_or(DEFAULT_MAX_STEPS),
            step_callback,
        }
    }

    /// Runs one requested call. Mistakes the model can fix come back as text.
    async fn run_tool(&self, call: &ToolCall) -> Result<(Value, String), AgentError> {
        let name = call.function.name.as_str();
        let raw = call.function.arguments.trim();
        let arguments = if raw.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str::<Value>(raw) {
                Ok(arguments) => arguments,
                Err(e) => {
                    warn!(tool = %name, error = %e, "Model sent invalid tool arguments");
                    let observation = format!("Error: invalid JSON arguments for {name}: {e}");
                    return Ok((Value::String(raw.to_string()), observation));
                }
            }
        };
        if !arguments.is_object() {
            warn!(tool = %name, "Model sent non-object tool arguments");
            let observation = format!("Error: arguments for {name} must be a JSON object");
            return Ok((arguments, observation));
        }

        debug!(tool = %name, "Calling tool");
        match self.executor.call_tool(name, arguments.clone()).await {
            Ok(ToolOutput { text, is_error }) => {
                if is_error {
                    warn!(tool = %name, "Tool reported an error");
                }
                Ok((arguments, text))
            }
            Err(MCPError::UnknownTool(unknown)) => {
                warn!(tool = %unknown, "Model requested an unknown tool");
                Ok((arguments, format!("Error: unknown tool {unknown}")))
            }
            Err(e) => Err(AgentError::ToolError(e)),
        }
    }
}

#[async_trait]
impl Agent for ReactAgent {
    async fn invoke(&self, messages: Vec<Message>) -> Result<AgentResponse, AgentError> {
        let mut history = messages;
        let mut steps = Vec::new();

        for step_number in 1..=self.max_steps {
            let mut request = Vec::with_capacity(history.len() + 1);
            request.push(Message::system(self.system_prompt.clone()));
            request.extend(history.iter().cloned());

            let reply = self.client.complete(request, self.tools.clone()).await?;
            let calls = reply.requested_calls().to_vec();
            let thought = reply.content.clone();
            history.push(reply);

            if calls.is_empty() {
                info!(steps = step_number, "Agent produced a final answer");
                return Ok(AgentResponse {
                    messages: history,
                    output: thought,
                    steps,
                });
            }

            for call in calls {
                let (action_input, observation) = self.run_tool(&call).await?;
                history.push(Message::tool(call.id.clone(), observation.clone()));

                let step = Step::new(
                    thought.clone(),
                    call.function.name.clone(),
                    action_input,
                    observation,
                );
                if let Some(ref callback) = self.step_callback {
                    callback(steps.len() + 1, &step);
                }
                steps.push(step);
            }
        }

        Err(AgentError::MaxStepsExceeded)
    }
}

pub struct ReactAgentBuilder {
    client: Arc<dyn LLMClient>,
    system_prompt: Option<String>,
    max_steps: Option<usize>,
    step_callback: Option<StepCallback>,
}

impl ReactAgentBuilder {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self {
            client,
            system_prompt: None,
            max_steps: None,
            step_callback: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_step_callback(mut self, callback: StepCallback) -> Self {
        self.step_callback = Some(callback);
        self
    }
}

impl AgentBuilder for ReactAgentBuilder {
    fn build(&self, tools: Vec<ToolDescriptor>, executor: Arc<dyn ToolExecutor>) -> Arc<dyn Agent> {
        let definitions: Vec<ToolDefinition> = tools.iter().map(ToolDescriptor::definition).collect();
        let system_prompt = build_agent_prompt(&definitions, self.system_prompt.clone());
        Arc::new(ReactAgent::new(
            Arc::clone(&self.client),
            definitions,
            executor,
            system_prompt,
            self.max_steps,
            self.step_callback.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{MessageRole, ModelInfo, ToolFunction};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedModel {
        replies: Mutex<VecDeque<Message>>,
        requests: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Message>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
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
            self.requests.lock().unwrap().push(messages);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LLMError::ApiError("script exhausted".to_string()))
        }

        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                name: "scripted".to_string(),
                max_tokens: None,
                supports_tools: true,
            }
        }
    }

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, MCPError> {
            match name {
                "echo" => Ok(ToolOutput {
                    text: arguments["text"].as_str().unwrap_or_default().to_string(),
                    is_error: false,
                }),
                "broken" => Err(MCPError::SessionClosed("remote".to_string())),
                other => Err(MCPError::UnknownTool(other.to_string())),
            }
        }
    }

    fn tool_call(id: &str, name: &str, arguments: &str) -> Message {
        Message {
            role: MessageRole::Assistant,
            content: String::new(),
            tool_calls: Some(vec![ToolCall {
                id: id.to_string(),
                function: ToolFunction {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                },
            }]),
            tool_call_id: None,
        }
    }

    fn agent(model: &Arc<ScriptedModel>, max_steps: usize) -> Arc<dyn Agent> {
        let client: Arc<dyn LLMClient> = Arc::clone(model) as Arc<dyn LLMClient>;
        ReactAgentBuilder::new(client)
            .with_max_steps(max_steps)
            .build(
                vec![ToolDescriptor {
                    server: "local".to_string(),
                    name: "echo".to_string(),
                    description: "Echo text".to_string(),
                    input_schema: json!({"type": "object"}),
                }],
                Arc::new(EchoExecutor),
            )
    }

    #[tokio::test]
    async fn test_direct_answer_keeps_input_prefix() {
        let model = ScriptedModel::new(vec![Message::assistant("Hi there")]);
        let response = agent(&model, 5)
            .invoke(vec![Message::user("hello")])
            .await
            .unwrap();

        assert_eq!(response.output, "Hi there");
        assert_eq!(response.messages[0], Message::user("hello"));
        assert_eq!(response.messages.len(), 2);

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests[0][0].role, MessageRole::System);
        assert!(requests[0][0].content.contains("- echo: Echo text"));
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let model = ScriptedModel::new(vec![
            tool_call("call_1", "echo", r#"{"text": "ping"}"#),
            Message::assistant("The tool said ping"),
        ]);
        let response = agent(&model, 5)
            .invoke(vec![Message::user("echo ping")])
            .await
            .unwrap();

        let roles: Vec<_> = response.messages.iter().map(|m| m.role.clone()).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::Tool,
                MessageRole::Assistant
            ]
        );
        assert_eq!(response.messages[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(response.messages[2].content, "ping");
        assert_eq!(response.steps.len(), 1);
        assert_eq!(response.steps[0].action, "echo");
        assert_eq!(response.output, "The tool said ping");
    }

    #[tokio::test]
    async fn test_recoverable_tool_mistakes_go_back_to_the_model() {
        let model = ScriptedModel::new(vec![
            tool_call("a", "missing", "{}"),
            tool_call("b", "echo", "{not json"),
            tool_call("c", "echo", "[1, 2]"),
            Message::assistant("done"),
        ]);
        let response = agent(&model, 5)
            .invoke(vec![Message::user("try")])
            .await
            .unwrap();

        assert_eq!(response.messages[2].content, "Error: unknown tool missing");
        assert!(response.messages[4].content.starts_with("Error: invalid JSON arguments"));
        assert_eq!(
            response.messages[6].content,
            "Error: arguments for echo must be a JSON object"
        );
        assert_eq!(response.output, "done");
    }

    #[tokio::test]
    async fn test_transport_failure_aborts_the_turn() {
        let model = ScriptedModel::new(vec![tool_call("a", "broken", "{}")]);
        let result = agent(&model, 5).invoke(vec![Message::user("go")]).await;

        assert!(matches!(result, Err(AgentError::ToolError(MCPError::SessionClosed(_)))));
    }

    #[tokio::test]
    async fn test_max_steps_exceeded() {
        let model = ScriptedModel::new(vec![
            tool_call("a", "echo", r#"{"text": "1"}"#),
            tool_call("b", "echo", r#"{"text": "2"}"#),
        ]);
        let result = agent(&model, 2).invoke(vec![Message::user("loop")]).await;

        assert!(matches!(result, Err(AgentError::MaxStepsExceeded)));
    }

    #[tokio::test]
    async fn test_step_callback_sees_each_tool_call() {
        let model = ScriptedModel::new(vec![
            tool_call("a", "echo", r#"{"text": "x"}"#),
            Message::assistant("ok"),
        ]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let client: Arc<dyn LLMClient> = Arc::clone(&model) as Arc<dyn LLMClient>;
        let agent = ReactAgentBuilder::new(client)
            .with_step_callback(Arc::new(move |n, step: &Step| {
                sink.lock().unwrap().push((n, step.action.clone()));
            }))
            .build(Vec::new(), Arc::new(EchoExecutor));

        agent.invoke(vec![Message::user("go")]).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(1, "echo".to_string())]);
    }
}

pub mod clients;
pub mod conversation;
pub mod coordinator;
pub mod core;
pub mod mcp;
pub mod prompts;
pub mod tools;

pub use clients::{
    LLMClient, LLMError, Message, MessageRole, OpenAIClient, ToolDefinition, create_llm_client,
};
pub use conversation::{ChatEntry, Turn, respond};
pub use coordinator::{Coordinator, CoordinatorError, CoordinatorState, InitError, ShutdownReport};
pub use core::{Agent, AgentBuilder, AgentResponse, ReactAgent, ReactAgentBuilder, Step, ToolExecutor};
pub use mcp::{MCPConfig, MCPError, McpConnector, ToolDescriptor, load_mcp_config};
pub use prompts::build_agent_prompt;
pub use tools::{ToolManager, ToolTrait, email_tools};

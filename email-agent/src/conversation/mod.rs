//! Translation between chat transcripts and the agent's message list.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::warn;

use crate::clients::{Message, MessageRole};
use crate::coordinator::Coordinator;
use crate::core::AgentResponse;

const LOG_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub title: String,
    pub log: Option<String>,
    pub status: Option<String>,
}

/// One line of the visible transcript.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub role: ChatRole,
    pub content: String,
    pub metadata: Option<EntryMetadata>,
}

impl ChatEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            metadata: None,
        }
    }

    /// Tool entries are display-only and never replayed to the agent.
    pub fn is_tool_entry(&self) -> bool {
        self.role == ChatRole::Assistant && self.metadata.is_some()
    }
}

/// Entries produced by one turn plus the raw messages to carry into the next.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub entries: Vec<ChatEntry>,
    pub state: Vec<Message>,
}

pub fn history_for_agent(history: &[ChatEntry]) -> Vec<Message> {
    history
        .iter()
        .filter(|entry| !entry.is_tool_entry() && !entry.content.trim().is_empty())
        .filter_map(|entry| match entry.role {
            ChatRole::User => Some(Message::user(entry.content.clone())),
            ChatRole::Assistant => Some(Message::assistant(entry.content.clone())),
            ChatRole::System => None,
        })
        .collect()
}

/// The final answer, falling back to the last message with text.
pub fn extract_text(response: &AgentResponse) -> String {
    if !response.output.trim().is_empty() {
        return response.output.clone();
    }
    response
        .messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant && !m.content.trim().is_empty())
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn preview(arguments: &str) -> String {
    let mut chars = arguments.chars();
    let head: String = chars.by_ref().take(LOG_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// One entry per tool call among `messages`, showing the matching tool result.
pub fn tool_entries(messages: &[Message]) -> Vec<ChatEntry> {
    let mut entries = Vec::new();
    for message in messages.iter().filter(|m| m.role == MessageRole::Assistant) {
        for call in message.requested_calls() {
            let name = &call.function.name;
            let result = messages.iter().find(|m| {
                m.role == MessageRole::Tool && m.tool_call_id.as_deref() == Some(call.id.as_str())
            });
            let arguments = call.function.arguments.trim();
            entries.push(ChatEntry {
                role: ChatRole::Assistant,
                content: result
                    .map(|m| m.content.clone())
                    .unwrap_or_else(|| format!("Called `{name}`.")),
                metadata: Some(EntryMetadata {
                    title: format!("🛠️ Used `{name}`"),
                    log: (!arguments.is_empty()).then(|| preview(arguments)),
                    status: Some("done".to_string()),
                }),
            });
        }
    }
    entries
}

/// Runs one chat turn. Agent failures become a visible error entry.
///
/// `state` is the message list returned by the previous turn. An empty
/// `history` starts a new conversation and discards it.
pub async fn respond(
    coordinator: &Coordinator,
    message: &str,
    history: &[ChatEntry],
    state: Option<Vec<Message>>,
) -> Turn {
    let carried = if history.is_empty() {
        None
    } else {
        state.filter(|messages| !messages.is_empty())
    };
    let mut messages = carried.unwrap_or_else(|| history_for_agent(history));
    messages.push(Message::user(message));
    let base = messages.len();

    match coordinator.invoke(messages.clone()).await {
        Ok((response, _)) => {
            let text = extract_text(&response);
            let mut entries = tool_entries(response.messages.get(base..).unwrap_or_default());
            entries.push(ChatEntry::assistant(text));
            Turn {
                entries,
                state: response.messages,
            }
        }
        Err(e) => {
            warn!(error = %e, "Agent turn failed");
            Turn {
                entries: vec![ChatEntry::assistant(format!("⚠️ Agent error: {e}"))],
                state: messages,
            }
        }
    }
}

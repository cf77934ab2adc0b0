use std::path::Path;

use crate::clients::ToolDefinition;
use crate::tools::classify::Category;

/// Agent prompt picked up when no `--system-prompt` is given.
pub const DEFAULT_SYSTEM_PROMPT_FILE: &str = "config/agent/system_prompt.md";

const DEFAULT_AGENT_PROMPT: &str = r#"You are an AI research assistant that helps users gather information on various topics using available tools.

## Guidelines
1. Use a tool whenever it can answer part of the question better than you can
2. Call tools with arguments that match their input schema
3. If a tool reports an error, explain it or try a different approach
4. Keep the final answer short and grounded in the tool results"#;

pub const DEFAULT_CLASSIFICATION_PROMPT: &str = r#"You sort incoming customer emails into exactly one category.

Read the email, decide which category fits best, and answer with a JSON object:
{"reason": "<one sentence explaining the choice>", "category": "<category name>"}

Use only the category names listed below. When nothing fits, answer "Other"."#;

/// Agent system prompt: the custom prompt (or the default one) followed by the tool list.
pub fn build_agent_prompt(tools: &[ToolDefinition], system_prompt: Option<String>) -> String {
    let tools_section = if tools.is_empty() {
        "You have no tools available.".to_string()
    } else {
        let tool_descriptions: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        format!(
            "You have access to the following tools:\n{}",
            tool_descriptions.join("\n")
        )
    };

    match system_prompt {
        Some(custom) if !custom.trim().is_empty() => {
            format!("{}\n\n{tools_section}", custom.trim_end())
        }
        _ => format!("{DEFAULT_AGENT_PROMPT}\n\n{tools_section}"),
    }
}

/// Reads the explicit prompt file, or `fallback` when it exists. A missing explicit file is an error.
pub async fn read_system_prompt(
    explicit: Option<&Path>,
    fallback: &Path,
) -> std::io::Result<Option<String>> {
    let path = match explicit {
        Some(path) => path,
        None if tokio::fs::try_exists(fallback).await? => fallback,
        None => return Ok(None),
    };
    tokio::fs::read_to_string(path).await.map(Some)
}

/// System prompt for one classification request: the base instructions plus the category guide.
pub fn build_classification_prompt(system_prompt: &str, categories: &[Category]) -> String {
    let guide: Vec<String> = categories
        .iter()
        .map(|c| format!("- **{}**: {}", c.category, c.description))
        .collect();
    format!(
        "{}\n\nValid categories:\n\n{}.",
        system_prompt.trim(),
        guide.join("\n")
    )
}

pub fn build_classification_request(message: &str) -> String {
    format!("Email to classify:\n{message}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_system_prompt_prefers_explicit_then_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("custom.md");
        let fallback = dir.path().join("agent").join("system_prompt.md");
        tokio::fs::write(&explicit, "Custom.").await.unwrap();

        assert_eq!(read_system_prompt(None, &fallback).await.unwrap(), None);
        assert_eq!(
            read_system_prompt(Some(explicit.as_path()), &fallback).await.unwrap().as_deref(),
            Some("Custom.")
        );

        tokio::fs::create_dir_all(fallback.parent().unwrap()).await.unwrap();
        tokio::fs::write(&fallback, "Default file.").await.unwrap();
        assert_eq!(
            read_system_prompt(None, &fallback).await.unwrap().as_deref(),
            Some("Default file.")
        );
        let missing = dir.path().join("missing.md");
        assert!(read_system_prompt(Some(missing.as_path()), &fallback).await.is_err());
    }

    #[test]
    fn test_build_agent_prompt_with_tools() {
        let tools = vec![
            ToolDefinition {
                name: "save_order".to_string(),
                description: "Save an order".to_string(),
                parameters: serde_json::json!({}),
            },
            ToolDefinition {
                name: "verify_order".to_string(),
                description: "Check an order".to_string(),
                parameters: serde_json::json!({}),
            },
        ];

        let prompt = build_agent_prompt(&tools, None);

        assert!(prompt.starts_with("You are an AI research assistant"));
        assert!(prompt.contains("- save_order: Save an order"));
        assert!(prompt.contains("- verify_order: Check an order"));
    }

    #[test]
    fn test_build_agent_prompt_empty_tools() {
        let prompt = build_agent_prompt(&[], None);

        assert!(prompt.contains("no tools available"));
    }

    #[test]
    fn test_build_agent_prompt_custom_system() {
        let tools = vec![ToolDefinition {
            name: "save_order".to_string(),
            description: "Save an order".to_string(),
            parameters: serde_json::json!({}),
        }];

        let prompt = build_agent_prompt(&tools, Some("You are a custom assistant.\n".to_string()));

        assert!(prompt.starts_with("You are a custom assistant.\n\n"));
        assert!(prompt.ends_with("- save_order: Save an order"));
        assert!(!prompt.contains("research assistant"));
        assert!(build_agent_prompt(&[], Some("  ".to_string())).contains("research assistant"));
        assert!(build_agent_prompt(&[], Some("Custom.".to_string())).ends_with("no tools available."));
    }

    #[test]
    fn test_build_classification_prompt_lists_categories() {
        let categories = vec![
            Category {
                category: "Order".to_string(),
                description: "Wants to buy something".to_string(),
            },
            Category {
                category: "Other".to_string(),
                description: "Anything else".to_string(),
            },
        ];

        let prompt = build_classification_prompt("Classify.\n", &categories);

        assert!(prompt.starts_with("Classify.\n\nValid categories:"));
        assert!(prompt.contains("- **Order**: Wants to buy something"));
        assert!(prompt.ends_with("- **Other**: Anything else."));
    }
}

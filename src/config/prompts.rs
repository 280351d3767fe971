//! Route-aware chat framing
//!
//! Each DevConsole page gets its own chat title, placeholder and suggested
//! prompts. The table is built in, or loaded from a TOML file.
//!
//! # Example Prompt File
//!
//! ```toml
//! [default]
//! title = "DevConsole Assistant"
//! placeholder = "Ask anything..."
//!
//! [[routes]]
//! path = "/monitor/notes"
//! title = "Notes Assistant"
//! suggestion_tags = ["Summarize my notes", "Find notes about deploys"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

use crate::conversation::ChatbotConfigPatch;

/// Chat framing for one route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePrompt {
    pub title: String,

    pub placeholder: String,

    #[serde(default)]
    pub initial_prompt: String,

    /// Suggested prompts shown before the first message
    #[serde(default)]
    pub suggestion_tags: Vec<String>,
}

impl RoutePrompt {
    fn new(title: &str, placeholder: &str, initial_prompt: &str, tags: &[&str]) -> Self {
        Self {
            title: title.to_string(),
            placeholder: placeholder.to_string(),
            initial_prompt: initial_prompt.to_string(),
            suggestion_tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl From<&RoutePrompt> for ChatbotConfigPatch {
    fn from(prompt: &RoutePrompt) -> Self {
        Self {
            title: Some(prompt.title.clone()),
            placeholder: Some(prompt.placeholder.clone()),
            initial_prompt: Some(prompt.initial_prompt.clone()),
            suggestion_tags: Some(prompt.suggestion_tags.clone()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub path: String,

    #[serde(flatten)]
    pub prompt: RoutePrompt,
}

/// Table of route prompts with a default fallback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePrompts {
    #[serde(default = "builtin_default")]
    pub default: RoutePrompt,

    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

fn builtin_default() -> RoutePrompt {
    RoutePrompt::new(
        "DevConsole Assistant",
        "Ask anything about DevConsole...",
        "Hi! I can help you find your way around DevConsole.",
        &["What can DevConsole do?", "How does SAML login work?"],
    )
}

impl Default for RoutePrompts {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RoutePrompts {
    /// Built-in table covering the DevConsole monitor pages
    pub fn builtin() -> Self {
        let route = |path: &str, prompt: RoutePrompt| RouteEntry {
            path: path.to_string(),
            prompt,
        };

        Self {
            default: builtin_default(),
            routes: vec![
                route(
                    "/monitor",
                    RoutePrompt::new(
                        "Monitor Assistant",
                        "Ask about the monitor dashboards...",
                        "Which dashboard can I help you with?",
                        &["What is on the monitor page?", "Where are my backups?"],
                    ),
                ),
                route(
                    "/monitor/bookmarks",
                    RoutePrompt::new(
                        "Bookmarks Assistant",
                        "Ask about bookmarks and collections...",
                        "Need help organizing your bookmarks?",
                        &["How do I reorder bookmarks?", "How do I create a collection?"],
                    ),
                ),
                route(
                    "/monitor/notes",
                    RoutePrompt::new(
                        "Notes Assistant",
                        "Ask about your notes...",
                        "Looking for a note? Ask me.",
                        &["How do I search notes?", "Can notes use Markdown?"],
                    ),
                ),
                route(
                    "/monitor/scripts",
                    RoutePrompt::new(
                        "Scripts Assistant",
                        "Ask about saved scripts...",
                        "I can help you manage your scripts.",
                        &["How do I add a script?", "How do I copy a script?"],
                    ),
                ),
                route(
                    "/monitor/s3",
                    RoutePrompt::new(
                        "Storage Assistant",
                        "Ask about buckets and objects...",
                        "Questions about S3 storage?",
                        &["How do I upload a file?", "How do I switch buckets?"],
                    ),
                ),
                route(
                    "/monitor/notion",
                    RoutePrompt::new(
                        "Notion Assistant",
                        "Ask about Notion pages...",
                        "I can help with the Notion integration.",
                        &["Why is a page missing?", "How do I connect a workspace?"],
                    ),
                ),
                route(
                    "/monitor/backups",
                    RoutePrompt::new(
                        "Backups Assistant",
                        "Ask about database backups...",
                        "Need help with backups?",
                        &["How do I restore a backup?", "How often do backups run?"],
                    ),
                ),
            ],
        }
    }

    /// Load a table from a TOML file
    pub async fn from_file(path: &Path) -> Result<Self, PromptError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| PromptError::IoError(e.to_string()))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, PromptError> {
        let table: Self =
            toml::from_str(content).map_err(|e| PromptError::ParseError(e.to_string()))?;

        if let Some(entry) = table.routes.iter().find(|r| !r.path.starts_with('/')) {
            return Err(PromptError::InvalidRoute(entry.path.clone()));
        }
        Ok(table)
    }

    /// Most specific prompt for a navigation path: exact match, then the
    /// longest prefix ending on a segment boundary, then the default.
    pub fn resolve(&self, path: &str) -> &RoutePrompt {
        let path = normalize(path);

        if let Some(entry) = self.routes.iter().find(|r| normalize(&r.path) == path) {
            return &entry.prompt;
        }

        self.routes
            .iter()
            .filter(|r| is_segment_prefix(normalize(&r.path), path))
            .max_by_key(|r| normalize(&r.path).len())
            .map(|r| &r.prompt)
            .unwrap_or(&self.default)
    }
}

/// Drop query string, fragment and trailing slashes
fn normalize(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    let trimmed = path[..end].trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

fn is_segment_prefix(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Errors from prompt loading
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Route path must start with '/': {0}")]
    InvalidRoute(String),
}

/// Built-in system prompts that don't require files
pub mod builtin {
    /// System prompt for OpenAI-style providers
    pub const DEFAULT: &str = "You are the DevConsole assistant, embedded in an internal \
        developer console that manages bookmarks, notes, shell scripts, S3-compatible storage, \
        Notion pages and PostgreSQL backups. Answer concisely and prefer step-by-step \
        instructions that reference the relevant DevConsole page.";
}

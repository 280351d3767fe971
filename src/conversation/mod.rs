//! Conversation types and chatbot configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry in the chat history.
///
/// A send produces two entries: the user's question and a placeholder that
/// receives the answer once the provider responds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub loading: bool,
    #[serde(default)]
    pub is_streaming: bool,
    /// User feedback: unset, liked or disliked
    #[serde(default)]
    pub liked: Option<bool>,
    #[serde(default)]
    pub suggestion_tags: Vec<String>,
    /// Answer was cut short by cancellation or a provider failure
    #[serde(default)]
    pub interrupted: bool,
    /// Provider-side id of the answer, used when reporting feedback upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl ChatMessage {
    pub fn question(text: impl Into<String>) -> Self {
        Self {
            question: Some(text.into()),
            question_timestamp: Some(Utc::now()),
            ..Self::empty()
        }
    }

    /// Placeholder answer awaiting the provider
    pub fn pending_answer() -> Self {
        Self {
            loading: true,
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            question: None,
            answer: None,
            question_timestamp: None,
            answer_timestamp: None,
            loading: false,
            is_streaming: false,
            liked: None,
            suggestion_tags: Vec::new(),
            interrupted: false,
            remote_id: None,
        }
    }

    pub fn has_answer_content(&self) -> bool {
        self.answer.as_deref().is_some_and(|a| !a.is_empty())
    }
}

/// Speaker of a turn sent to a provider as history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Flatten display messages into provider history, oldest first, keeping
/// at most `limit` turns. Pending and interrupted answers are skipped.
pub fn history_turns(messages: &[ChatMessage], limit: usize) -> Vec<Turn> {
    let turns: Vec<Turn> = messages
        .iter()
        .flat_map(|m| {
            let question = m.question.as_ref().map(Turn::user);
            let answer = if m.loading || m.is_streaming || m.interrupted {
                None
            } else {
                m.answer
                    .as_ref()
                    .filter(|a| !a.is_empty())
                    .map(Turn::assistant)
            };
            question.into_iter().chain(answer)
        })
        .collect();

    let skip = turns.len().saturating_sub(limit);
    turns.into_iter().skip(skip).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    #[default]
    BottomRight,
    BottomLeft,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetSize {
    Small,
    #[default]
    Medium,
    Large,
}

/// Presentation settings for the chat widget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotConfig {
    pub title: String,
    pub placeholder: String,
    pub initial_prompt: String,
    pub suggestion_tags: Vec<String>,
    pub position: Position,
    pub theme: Theme,
    pub size: WidgetSize,
}

impl Default for ChatbotConfig {
    fn default() -> Self {
        Self {
            title: "DevConsole Assistant".to_string(),
            placeholder: "Ask anything about DevConsole...".to_string(),
            initial_prompt: "Hi! How can I help you today?".to_string(),
            suggestion_tags: Vec::new(),
            position: Position::default(),
            theme: Theme::default(),
            size: WidgetSize::default(),
        }
    }
}

impl ChatbotConfig {
    /// Shallow merge: only keys present in the patch are replaced
    pub fn merge(&mut self, patch: ChatbotConfigPatch) {
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(placeholder) = patch.placeholder {
            self.placeholder = placeholder;
        }
        if let Some(initial_prompt) = patch.initial_prompt {
            self.initial_prompt = initial_prompt;
        }
        if let Some(tags) = patch.suggestion_tags {
            self.suggestion_tags = tags;
        }
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(theme) = patch.theme {
            self.theme = theme;
        }
        if let Some(size) = patch.size {
            self.size = size;
        }
    }
}

/// Partial update for [`ChatbotConfig`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotConfigPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub suggestion_tags: Option<Vec<String>>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub theme: Option<Theme>,
    #[serde(default)]
    pub size: Option<WidgetSize>,
}

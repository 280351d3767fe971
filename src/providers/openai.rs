//! OpenAI-style chat completions provider
//!
//! Works with any API that implements the OpenAI chat completions format,
//! in blocking mode or with `stream: true` (server-sent events terminated
//! by `data: [DONE]`).

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{prompts_builtin, Config};
use crate::conversation::{Role, Turn};

use super::sse::{self, SseEvent};
use super::{
    cancellable, check_status, ChatProvider, Completion, ProviderError, ProviderReply,
    ProviderRequest, ProviderStream, StreamEvent,
};

/// OpenAI-compatible chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: match turn.role {
                Role::User => "user".to_string(),
                Role::Assistant => "assistant".to_string(),
            },
            content: turn.content.clone(),
        }
    }
}

/// Chat completion request
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

/// Chat completion response
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// One `data:` record of a streamed completion
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    /// Base URL for the API (e.g., https://api.openai.com/v1)
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Optional organization ID
    pub organization: Option<String>,
    pub system_prompt: String,
    pub timeout_secs: u64,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            organization: None,
            system_prompt: prompts_builtin::DEFAULT.to_string(),
            timeout_secs: 120,
        }
    }
}

impl OpenAIConfig {
    pub fn from_app_config(config: &Config) -> Self {
        Self {
            base_url: config.openai_base_url.clone(),
            api_key: config.openai_api_key.clone(),
            model: config.openai_model.clone(),
            organization: config.openai_organization.clone(),
            system_prompt: prompts_builtin::DEFAULT.to_string(),
            timeout_secs: config.request_timeout_secs,
        }
    }
}

/// What one streamed record means for the answer
#[derive(Debug, PartialEq)]
enum ChunkOutcome {
    Text(String),
    Done,
    Skip,
}

fn interpret_chunk(event: &SseEvent) -> Result<ChunkOutcome, ProviderError> {
    if event.is_done() {
        return Ok(ChunkOutcome::Done);
    }
    if event.data.trim().is_empty() {
        return Ok(ChunkOutcome::Skip);
    }

    let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::warn!("Skipping unparseable completion chunk: {} - {}", e, event.data);
            return Ok(ChunkOutcome::Skip);
        }
    };

    if let Some(error) = chunk.error {
        return Err(ProviderError::Stream {
            code: error
                .code
                .or(error.error_type)
                .unwrap_or_else(|| "error".to_string()),
            message: error.message,
        });
    }

    tracing::trace!(id = ?chunk.id, "completion chunk");
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();

    if text.is_empty() {
        Ok(ChunkOutcome::Skip)
    } else {
        Ok(ChunkOutcome::Text(text))
    }
}

/// OpenAI-compatible API provider
pub struct OpenAIProvider {
    config: OpenAIConfig,
    client: Client,
}

impl OpenAIProvider {
    /// Fails when no API key is configured
    pub fn new(config: OpenAIConfig) -> Result<Self, ProviderError> {
        if config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(ProviderError::NotConfigured(
                "OPENAI_API_KEY is required for the openai provider".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn build_request(&self, request: &ProviderRequest, stream: bool) -> reqwest::RequestBuilder {
        let mut messages = vec![ChatMessage {
            role: "system".to_string(),
            content: self.config.system_prompt.clone(),
        }];
        messages.extend(request.history.iter().map(ChatMessage::from));
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.text.clone(),
        });

        let body = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            temperature: Some(0.7),
            max_tokens: Some(2048),
            stream,
            user: (!request.user.is_empty()).then(|| request.user.clone()),
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .json(&body);

        if let Some(ref api_key) = self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }
        if let Some(ref org) = self.config.organization {
            builder = builder.header("OpenAI-Organization", org);
        }
        builder
    }
}

#[async_trait]
impl ChatProvider for OpenAIProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn send_message(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderReply, ProviderError> {
        let response = cancellable(cancel, self.build_request(request, false).send()).await??;
        let response = check_status(response, cancel).await?;

        let body = cancellable(cancel, response.text()).await??;
        let completion: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse response: {} - Body: {}", e, body))
        })?;

        let answer = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".to_string()))?
            .message
            .content
            .unwrap_or_default();

        Ok(ProviderReply {
            answer,
            conversation_id: None,
            message_id: completion.id,
            suggestions: Vec::new(),
        })
    }

    fn send_message_stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> ProviderStream {
        let builder = self.build_request(&request, true);

        Box::pin(try_stream! {
            let response = cancellable(&cancel, builder.send()).await??;
            let response = check_status(response, &cancel).await?;

            let events = sse::event_stream(response.bytes_stream());
            futures::pin_mut!(events);

            let mut finished = false;
            while let Some(event) = cancellable(&cancel, events.next()).await? {
                match interpret_chunk(&event?)? {
                    ChunkOutcome::Text(text) => {
                        yield StreamEvent::Delta(text);
                    }
                    ChunkOutcome::Done => {
                        finished = true;
                        break;
                    }
                    ChunkOutcome::Skip => {}
                }
            }

            if !finished {
                tracing::warn!("Completion stream ended without [DONE]");
            }
            yield StreamEvent::Complete(Completion::default());
        })
    }
}

//! Dify chat-app provider
//!
//! Dify keeps conversation state on the server: the first reply assigns a
//! `conversation_id` that later requests send back instead of history.

use std::collections::HashMap;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

use super::sse::{self, SseEvent};
use super::{
    cancellable, check_status, ChatProvider, Completion, ProviderError, ProviderReply,
    ProviderRequest, ProviderStream, StreamEvent,
};

#[derive(Debug, Clone)]
pub struct DifyConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Fetch follow-up questions after each answer
    pub suggestions: bool,
    pub timeout_secs: u64,
}

impl Default for DifyConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.dify.ai/v1".to_string(),
            api_key: None,
            suggestions: true,
            timeout_secs: 120,
        }
    }
}

impl DifyConfig {
    pub fn from_app_config(config: &Config) -> Self {
        Self {
            base_url: config.dify_base_url.clone(),
            api_key: config.dify_api_key.clone(),
            suggestions: config.dify_suggestions,
            timeout_secs: config.request_timeout_secs,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessagesRequest<'a> {
    inputs: HashMap<String, String>,
    query: &'a str,
    response_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    user: &'a str,
}

/// Blocking-mode response
#[derive(Debug, Deserialize)]
struct ChatMessagesResponse {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
}

/// One streamed record; Dify tags every record with an `event` field
#[derive(Debug, Deserialize)]
struct DifyEvent {
    event: String,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SuggestedResponse {
    #[serde(default)]
    data: Vec<String>,
}

#[derive(Debug, PartialEq)]
enum EventOutcome {
    Text {
        answer: String,
        conversation_id: Option<String>,
    },
    End {
        conversation_id: Option<String>,
        message_id: Option<String>,
    },
    Skip,
}

fn interpret_event(event: &SseEvent) -> Result<EventOutcome, ProviderError> {
    if event.data.trim().is_empty() {
        return Ok(EventOutcome::Skip);
    }

    let parsed: DifyEvent = match serde_json::from_str(&event.data) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!("Skipping unparseable Dify event: {} - {}", e, event.data);
            return Ok(EventOutcome::Skip);
        }
    };

    match parsed.event.as_str() {
        "message" | "agent_message" => Ok(match parsed.answer {
            Some(answer) if !answer.is_empty() => EventOutcome::Text {
                answer,
                conversation_id: parsed.conversation_id,
            },
            _ => EventOutcome::Skip,
        }),
        "message_end" => Ok(EventOutcome::End {
            conversation_id: parsed.conversation_id,
            message_id: parsed.message_id,
        }),
        "error" => Err(ProviderError::Stream {
            code: parsed.code.unwrap_or_else(|| "error".to_string()),
            message: parsed
                .message
                .unwrap_or_else(|| "Unknown stream error".to_string()),
        }),
        other => {
            tracing::trace!("Ignoring Dify event {}", other);
            Ok(EventOutcome::Skip)
        }
    }
}

pub struct DifyProvider {
    config: DifyConfig,
    client: Client,
}

impl DifyProvider {
    /// Fails when no API key is configured
    pub fn new(config: DifyConfig) -> Result<Self, ProviderError> {
        if config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(ProviderError::NotConfigured(
                "DIFY_API_KEY is required for the dify provider".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn build_request(&self, request: &ProviderRequest, mode: &'static str) -> reqwest::RequestBuilder {
        let body = ChatMessagesRequest {
            inputs: HashMap::new(),
            query: &request.text,
            response_mode: mode,
            conversation_id: request.conversation_id.as_deref(),
            user: &request.user,
        };

        let builder = self
            .client
            .post(format!("{}/chat-messages", self.config.base_url))
            .json(&body);
        with_auth(builder, &self.config)
    }
}

fn suggestions_request(
    client: &Client,
    config: &DifyConfig,
    message_id: &str,
    user: &str,
) -> reqwest::RequestBuilder {
    let builder = client
        .get(format!("{}/messages/{}/suggested", config.base_url, message_id))
        .query(&[("user", user)]);
    with_auth(builder, config)
}

fn with_auth(builder: reqwest::RequestBuilder, config: &DifyConfig) -> reqwest::RequestBuilder {
    match config.api_key {
        Some(ref key) => builder.bearer_auth(key),
        None => builder,
    }
}

/// Follow-up questions for a finished answer. Failures only cost the
/// suggestions, never the answer.
async fn fetch_suggestions(builder: reqwest::RequestBuilder, cancel: &CancellationToken) -> Vec<String> {
    let result = async {
        let response = cancellable(cancel, builder.send()).await??;
        let response = check_status(response, cancel).await?;
        let body: SuggestedResponse = cancellable(cancel, response.json()).await??;
        Ok::<_, ProviderError>(body.data)
    }
    .await;

    match result {
        Ok(suggestions) => suggestions,
        Err(ProviderError::Cancelled) => Vec::new(),
        Err(e) => {
            tracing::warn!("Failed to fetch suggested questions: {}", e);
            Vec::new()
        }
    }
}

#[async_trait]
impl ChatProvider for DifyProvider {
    fn name(&self) -> &'static str {
        "dify"
    }

    async fn send_message(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderReply, ProviderError> {
        let response = cancellable(cancel, self.build_request(request, "blocking").send()).await??;
        let response = check_status(response, cancel).await?;

        let body = cancellable(cancel, response.text()).await??;
        let reply: ChatMessagesResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse response: {} - Body: {}", e, body))
        })?;

        let suggestions = match (self.config.suggestions, reply.message_id.as_deref()) {
            (true, Some(id)) => {
                let follow_up = suggestions_request(&self.client, &self.config, id, &request.user);
                fetch_suggestions(follow_up, cancel).await
            }
            _ => Vec::new(),
        };

        Ok(ProviderReply {
            answer: reply.answer,
            conversation_id: reply.conversation_id,
            message_id: reply.message_id,
            suggestions,
        })
    }

    fn send_message_stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> ProviderStream {
        let builder = self.build_request(&request, "streaming");
        let client = self.client.clone();
        let config = self.config.clone();

        Box::pin(try_stream! {
            let response = cancellable(&cancel, builder.send()).await??;
            let response = check_status(response, &cancel).await?;

            let events = sse::event_stream(response.bytes_stream());
            futures::pin_mut!(events);

            let mut conversation_id = request.conversation_id.clone();
            let mut message_id = None;
            let mut finished = false;

            while let Some(event) = cancellable(&cancel, events.next()).await? {
                match interpret_event(&event?)? {
                    EventOutcome::Text { answer, conversation_id: assigned } => {
                        if assigned.is_some() {
                            conversation_id = assigned;
                        }
                        yield StreamEvent::Delta(answer);
                    }
                    EventOutcome::End { conversation_id: assigned, message_id: id } => {
                        if assigned.is_some() {
                            conversation_id = assigned;
                        }
                        message_id = id;
                        finished = true;
                        break;
                    }
                    EventOutcome::Skip => {}
                }
            }

            if !finished {
                tracing::warn!("Dify stream ended without message_end");
            }

            let suggestions = match (config.suggestions, message_id.as_deref()) {
                (true, Some(id)) => {
                    let follow_up = suggestions_request(&client, &config, id, &request.user);
                    fetch_suggestions(follow_up, &cancel).await
                }
                _ => Vec::new(),
            };

            yield StreamEvent::Complete(Completion {
                conversation_id,
                message_id,
                suggestions,
            });
        })
    }
}

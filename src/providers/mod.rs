//! AI provider integrations
//!
//! Every backend answers a [`ProviderRequest`] either with one blocking
//! [`ProviderReply`] or with a [`ProviderStream`] of text fragments that
//! ends in a [`StreamEvent::Complete`] marker.

mod dify;
mod mock;
mod openai;
pub mod sse;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::conversation::Turn;

pub use dify::{DifyConfig, DifyProvider};
pub use mock::{MockConfig, MockProvider};
pub use openai::{OpenAIConfig, OpenAIProvider};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Stream error ({code}): {message}")]
    Stream { code: String, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request cancelled")]
    Cancelled,
}

/// Everything a provider needs to answer one user message
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub text: String,
    /// Prior turns, oldest first
    pub history: Vec<Turn>,
    /// Server-side conversation to continue, if one was assigned
    pub conversation_id: Option<String>,
    /// Per-browser session identifier, used as the end-user id
    pub user: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderReply {
    pub answer: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub suggestions: Vec<String>,
}

/// Terminal marker of a streamed answer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Complete(Completion),
}

pub type ProviderStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Answer in one piece
    async fn send_message(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderReply, ProviderError>;

    /// Answer incrementally. Each call opens a fresh request.
    fn send_message_stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> ProviderStream;
}

/// Build the provider selected by configuration.
///
/// Missing credentials fail here, at startup, rather than per call.
pub fn from_config(config: &Config) -> Result<Arc<dyn ChatProvider>, ProviderError> {
    let name = match config.provider.to_lowercase().as_str() {
        "auto" => {
            if config.dify_api_key.is_some() {
                "dify"
            } else if config.openai_api_key.is_some() {
                "openai"
            } else {
                "mock"
            }
        }
        "mock" => "mock",
        "openai" => "openai",
        "dify" => "dify",
        other => return Err(ProviderError::UnknownProvider(other.to_string())),
    };

    let provider: Arc<dyn ChatProvider> = match name {
        "openai" => Arc::new(OpenAIProvider::new(OpenAIConfig::from_app_config(config))?),
        "dify" => Arc::new(DifyProvider::new(DifyConfig::from_app_config(config))?),
        _ => Arc::new(MockProvider::new(MockConfig {
            delay_min_ms: config.mock_delay_min_ms,
            delay_max_ms: config.mock_delay_max_ms,
        })),
    };

    tracing::info!("🤖 Using {} provider", provider.name());
    Ok(provider)
}

/// Race a future against the request's cancellation token
pub(crate) async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, ProviderError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Pass 2xx responses through, convert anything else into an error
pub(crate) async fn check_status(
    response: reqwest::Response,
    cancel: &CancellationToken,
) -> Result<reqwest::Response, ProviderError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(error_from_response(response, cancel).await)
    }
}

/// Turn a non-2xx response into [`ProviderError::Http`], preferring the
/// message the server put in its JSON body. The body read still honours
/// cancellation.
async fn error_from_response(
    response: reqwest::Response,
    cancel: &CancellationToken,
) -> ProviderError {
    let status = response.status().as_u16();
    let body = match cancellable(cancel, response.text()).await {
        Ok(body) => body.unwrap_or_default(),
        Err(cancelled) => return cancelled,
    };
    ProviderError::Http {
        status,
        message: server_message(&body).unwrap_or(body),
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<NestedError>,
}

#[derive(Debug, Deserialize)]
struct NestedError {
    message: String,
}

/// Extract `message` (Dify) or `error.message` (OpenAI) from an error body
fn server_message(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    parsed.error.map(|e| e.message).or(parsed.message)
}

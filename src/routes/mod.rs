//! API routes

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, patch, post, put},
    Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::conversation::{ChatbotConfig, ChatbotConfigPatch};
use crate::core::{ChatSnapshot, StoreError};
use crate::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    provider: &'static str,
    streaming: bool,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub aborted: bool,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenRequest {
    pub open: bool,
}

#[derive(Debug, Serialize)]
pub struct OpenResponse {
    pub open: bool,
}

#[derive(Debug, Deserialize)]
pub struct NavigateRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    /// `null` clears earlier feedback
    pub liked: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub chatbot_id: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        provider: state.store.provider_name(),
        streaming: state.config.streaming,
    })
}

async fn chat_state(State(state): State<AppState>) -> Json<ChatSnapshot> {
    Json(state.store.snapshot())
}

/// Current snapshot first, then one event per published change
async fn chat_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut updates = state.store.subscribe();

    let stream = async_stream::stream! {
        loop {
            let snapshot = updates.borrow_and_update().clone();
            match Event::default().event("snapshot").json_data(&snapshot) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!("Failed to encode snapshot event: {}", e),
            }
            if updates.changed().await.is_err() {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Accept a message and answer it in the background
async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> (StatusCode, Json<SendResponse>) {
    let Some(pending) = state.store.begin_message(&request.text) else {
        return (StatusCode::OK, Json(SendResponse { accepted: false }));
    };

    let store = state.store.clone();
    tokio::spawn(async move {
        let outcome = store.run(pending).await;
        tracing::debug!("Chat request finished: {:?}", outcome);
    });

    (StatusCode::ACCEPTED, Json(SendResponse { accepted: true }))
}

async fn clear_messages(State(state): State<AppState>) -> StatusCode {
    state.store.clear_messages();
    StatusCode::NO_CONTENT
}

async fn abort(State(state): State<AppState>) -> Json<AbortResponse> {
    Json(AbortResponse {
        aborted: state.store.abort_current_message(),
    })
}

async fn update_config(
    State(state): State<AppState>,
    Json(changes): Json<ChatbotConfigPatch>,
) -> Json<ChatbotConfig> {
    state.store.set_config(changes);
    Json(state.store.snapshot().config)
}

async fn set_input(
    State(state): State<AppState>,
    Json(request): Json<InputRequest>,
) -> StatusCode {
    state.store.set_input(request.text);
    StatusCode::NO_CONTENT
}

async fn set_open(
    State(state): State<AppState>,
    Json(request): Json<OpenRequest>,
) -> Json<OpenResponse> {
    state.store.set_open(request.open);
    Json(OpenResponse { open: request.open })
}

async fn toggle_open(State(state): State<AppState>) -> Json<OpenResponse> {
    Json(OpenResponse {
        open: state.store.toggle_open(),
    })
}

async fn navigate(
    State(state): State<AppState>,
    Json(request): Json<NavigateRequest>,
) -> Json<ChatbotConfig> {
    Json(state.store.apply_route(&state.prompts, &request.path))
}

async fn feedback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<FeedbackRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .store
        .set_liked(&id, request.liked)
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| match e {
            StoreError::MessageNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
            other => (StatusCode::BAD_REQUEST, other.to_string()),
        })
}

async fn reset_session(
    State(state): State<AppState>,
) -> Result<Json<SessionResponse>, (StatusCode, String)> {
    let chatbot_id = state.session.regenerate_chatbot_id().await.map_err(|e| {
        tracing::error!("Failed to regenerate chatbot id: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    state.store.set_chatbot_id(chatbot_id.clone());
    Ok(Json(SessionResponse { chatbot_id }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/state", get(chat_state))
        .route("/v1/chat/events", get(chat_events))
        .route(
            "/v1/chat/messages",
            post(send_message).delete(clear_messages),
        )
        .route("/v1/chat/messages/:id/feedback", put(feedback))
        .route("/v1/chat/abort", post(abort))
        .route("/v1/chat/config", patch(update_config))
        .route("/v1/chat/input", put(set_input))
        .route("/v1/chat/open", put(set_open))
        .route("/v1/chat/open/toggle", post(toggle_open))
        .route("/v1/chat/navigate", post(navigate))
        .route("/v1/chat/session/reset", post(reset_session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::config::{Config, RoutePrompts};
    use crate::core::{ChatStore, SessionStore, StoreOptions};
    use crate::providers::{MockConfig, MockProvider};

    async fn test_state() -> AppState {
        let config = Config::from_lookup(|_| None).unwrap();
        let provider = Arc::new(MockProvider::new(MockConfig {
            delay_min_ms: 0,
            delay_max_ms: 0,
        }));
        let session = SessionStore::new_in_memory().await.unwrap();
        let chatbot_id = session.load_or_create_chatbot_id().await.unwrap();

        AppState {
            store: Arc::new(ChatStore::new(
                provider,
                StoreOptions::default(),
                chatbot_id,
                ChatbotConfig::default(),
            )),
            session: Arc::new(session),
            prompts: Arc::new(RoutePrompts::builtin()),
            config,
        }
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router()
            .with_state(state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state().await;
        let (status, body) = call(&state, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["provider"], "mock");
    }

    #[tokio::test]
    async fn test_send_and_read_state() {
        let state = test_state().await;
        let mut updates = state.store.subscribe();

        let (status, body) = call(
            &state,
            "POST",
            "/v1/chat/messages",
            Some(json!({ "text": "How do I log in with SAML?" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], true);

        updates
            .wait_for(|s| !s.is_loading && !s.is_streaming && s.messages.len() == 2)
            .await
            .unwrap();

        let (status, body) = call(&state, "GET", "/v1/chat/state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"][0]["question"], "How do I log in with SAML?");
        assert!(body["messages"][1]["answer"].as_str().unwrap().contains("SAML"));
        assert_eq!(body["isLoading"], false);
        assert!(body["conversationId"].as_str().unwrap().starts_with("mock-"));
    }

    #[tokio::test]
    async fn test_empty_message_not_accepted() {
        let state = test_state().await;
        let (status, body) =
            call(&state, "POST", "/v1/chat/messages", Some(json!({ "text": "  " }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], false);
        assert!(state.store.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn test_abort_when_idle() {
        let state = test_state().await;
        let (status, body) = call(&state, "POST", "/v1/chat/abort", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["aborted"], false);
    }

    #[tokio::test]
    async fn test_config_patch_and_navigate() {
        let state = test_state().await;

        let (status, body) = call(
            &state,
            "PATCH",
            "/v1/chat/config",
            Some(json!({ "theme": "dark", "position": "bottom-left" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["theme"], "dark");
        assert_eq!(body["position"], "bottom-left");

        let (_, body) = call(
            &state,
            "POST",
            "/v1/chat/navigate",
            Some(json!({ "path": "/monitor/notes" })),
        )
        .await;
        assert_eq!(body["title"], "Notes Assistant");
        assert_eq!(body["theme"], "dark");
    }

    #[tokio::test]
    async fn test_input_and_open() {
        let state = test_state().await;

        let (status, _) =
            call(&state, "PUT", "/v1/chat/input", Some(json!({ "text": "draft" }))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.store.snapshot().input, "draft");

        let (_, body) = call(&state, "PUT", "/v1/chat/open", Some(json!({ "open": true }))).await;
        assert_eq!(body["open"], true);
        let (_, body) = call(&state, "POST", "/v1/chat/open/toggle", None).await;
        assert_eq!(body["open"], false);
    }

    #[tokio::test]
    async fn test_feedback_unknown_message() {
        let state = test_state().await;
        let (status, _) = call(
            &state,
            "PUT",
            "/v1/chat/messages/nope/feedback",
            Some(json!({ "liked": true })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_feedback_on_answer() {
        let state = test_state().await;
        state.store.send_message("hello").await;
        let answer_id = state.store.snapshot().messages[1].id.clone();

        let (status, _) = call(
            &state,
            "PUT",
            &format!("/v1/chat/messages/{}/feedback", answer_id),
            Some(json!({ "liked": false })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.store.snapshot().messages[1].liked, Some(false));
    }

    #[tokio::test]
    async fn test_clear_and_session_reset() {
        let state = test_state().await;
        state.store.send_message("hello").await;
        let original_id = state.store.snapshot().chatbot_id;

        let (status, _) = call(&state, "DELETE", "/v1/chat/messages", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.store.snapshot().messages.is_empty());

        let (status, body) = call(&state, "POST", "/v1/chat/session/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        let new_id = body["chatbotId"].as_str().unwrap().to_string();
        assert_ne!(new_id, original_id);
        assert_eq!(state.store.snapshot().chatbot_id, new_id);
    }
}

//! Chat store
//!
//! The `ChatStore` is the single source of truth for the chat widget and
//! the only component that starts provider calls. It:
//! 1. Guards against overlapping requests (one in flight at a time)
//! 2. Appends the question and a placeholder answer
//! 3. Feeds the provider reply, blocking or streamed, into the placeholder
//! 4. Turns cancellation and failures into a terminal message state
//! 5. Publishes a snapshot to subscribers after every change

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::RoutePrompts;
use crate::conversation::{history_turns, ChatMessage, ChatbotConfig, ChatbotConfigPatch};
use crate::providers::{
    ChatProvider, Completion, ProviderError, ProviderRequest, StreamEvent,
};

/// Shown in place of an answer that was cancelled before any content
pub const CANCELLED_NOTICE: &str = "Response cancelled.";

/// Shown when the provider failed
pub const ERROR_NOTICE: &str =
    "Sorry, something went wrong while generating a response. Please try again.";

/// Lifecycle of the single request slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPhase {
    Idle,
    Sending,
    Streaming,
    /// Cancelled; the worker has not unwound yet
    Aborting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Begin,
    Chunk,
    Finish,
    Abort,
    Unwind,
}

impl RequestPhase {
    pub fn transition(self, event: PhaseEvent) -> Result<RequestPhase, StoreError> {
        use PhaseEvent::*;
        use RequestPhase::*;

        match (self, event) {
            (Idle | Aborting, Begin) => Ok(Sending),
            (Sending | Streaming, Chunk) => Ok(Streaming),
            (Sending | Streaming, Finish) => Ok(Idle),
            (Sending | Streaming, Abort) => Ok(Aborting),
            (Aborting, Unwind) => Ok(Idle),
            (from, event) => Err(StoreError::InvalidTransition { from, event }),
        }
    }

    /// A request is outstanding and new sends must be refused
    pub fn is_busy(self) -> bool {
        matches!(self, RequestPhase::Sending | RequestPhase::Streaming)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid transition from {from:?} on {event:?}")]
    InvalidTransition {
        from: RequestPhase,
        event: PhaseEvent,
    },

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Message {0} is not an answer")]
    NotAnAnswer(String),
}

/// Result of a `send_message` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendOutcome {
    /// Empty text, or another request was in flight
    Rejected,
    Completed,
    Cancelled,
    Failed,
}

/// Observable store state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    pub messages: Vec<ChatMessage>,
    pub input: String,
    pub is_loading: bool,
    pub is_streaming: bool,
    pub phase: RequestPhase,
    pub conversation_id: Option<String>,
    pub chatbot_id: String,
    pub config: ChatbotConfig,
    pub is_open: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub streaming: bool,
    pub history_limit: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            streaming: true,
            history_limit: 10,
        }
    }
}

/// An accepted send, ready to be driven by [`ChatStore::run`]
#[derive(Debug)]
pub struct PendingRequest {
    generation: u64,
    cancel: CancellationToken,
    answer_id: String,
    pub request: ProviderRequest,
}

struct ActiveRequest {
    generation: u64,
    cancel: CancellationToken,
    answer_id: String,
}

struct StoreInner {
    messages: Vec<ChatMessage>,
    input: String,
    phase: RequestPhase,
    active: Option<ActiveRequest>,
    next_generation: u64,
    conversation_id: Option<String>,
    chatbot_id: String,
    config: ChatbotConfig,
    is_open: bool,
}

impl StoreInner {
    fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            messages: self.messages.clone(),
            input: self.input.clone(),
            is_loading: self.phase == RequestPhase::Sending,
            is_streaming: self.phase == RequestPhase::Streaming,
            phase: self.phase,
            conversation_id: self.conversation_id.clone(),
            chatbot_id: self.chatbot_id.clone(),
            config: self.config.clone(),
            is_open: self.is_open,
        }
    }

    fn transition(&mut self, event: PhaseEvent) -> bool {
        match self.phase.transition(event) {
            Ok(next) => {
                self.phase = next;
                true
            }
            Err(e) => {
                tracing::warn!("{}", e);
                false
            }
        }
    }

    /// The request still owns the slot and was not cancelled
    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.generation == generation && !a.cancel.is_cancelled())
    }

    fn owns_slot(&self, generation: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.generation == generation)
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Cancel the active request and close its placeholder
    fn abort_active(&mut self) -> bool {
        if !self.phase.is_busy() {
            return false;
        }
        let Some(active) = self.active.as_ref() else {
            return false;
        };

        active.cancel.cancel();
        let answer_id = active.answer_id.clone();
        self.transition(PhaseEvent::Abort);

        if let Some(message) = self.message_mut(&answer_id) {
            if message.loading || message.is_streaming {
                message.loading = false;
                message.is_streaming = false;
                message.interrupted = true;
                message.answer_timestamp = Some(Utc::now());
                if !message.has_answer_content() {
                    message.answer = Some(CANCELLED_NOTICE.to_string());
                }
            }
        }
        true
    }
}

pub struct ChatStore {
    provider: Arc<dyn ChatProvider>,
    options: StoreOptions,
    inner: Mutex<StoreInner>,
    updates: watch::Sender<ChatSnapshot>,
}

impl ChatStore {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        options: StoreOptions,
        chatbot_id: String,
        config: ChatbotConfig,
    ) -> Self {
        let inner = StoreInner {
            messages: Vec::new(),
            input: String::new(),
            phase: RequestPhase::Idle,
            active: None,
            next_generation: 0,
            conversation_id: None,
            chatbot_id,
            config,
            is_open: false,
        };
        let (updates, _) = watch::channel(inner.snapshot());

        Self {
            provider,
            options,
            inner: Mutex::new(inner),
            updates,
        }
    }

    /// Apply a change under the lock. Returning `None` means nothing
    /// changed and no snapshot is published.
    fn mutate<R>(&self, f: impl FnOnce(&mut StoreInner) -> Option<R>) -> Option<R> {
        let mut inner = self.inner.lock();
        let out = f(&mut inner)?;
        self.updates.send_replace(inner.snapshot());
        Some(out)
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.inner.lock().snapshot()
    }

    /// Receiver that observes every published change
    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.updates.subscribe()
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Send a message and drive it to completion.
    ///
    /// Never fails: provider errors end up as the answer's terminal state.
    pub async fn send_message(&self, text: &str) -> SendOutcome {
        match self.begin_message(text) {
            Some(pending) => self.run(pending).await,
            None => SendOutcome::Rejected,
        }
    }

    /// Accept a message if the request slot is free.
    ///
    /// The busy check, the slot claim and the append of the question and
    /// its placeholder happen under one lock.
    pub fn begin_message(&self, text: &str) -> Option<PendingRequest> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let history_limit = self.options.history_limit;
        self.mutate(|inner| {
            if inner.phase.is_busy() {
                tracing::debug!("Ignoring send while a request is in flight");
                return None;
            }
            if !inner.transition(PhaseEvent::Begin) {
                return None;
            }

            let history = history_turns(&inner.messages, history_limit);
            let answer = ChatMessage::pending_answer();
            let answer_id = answer.id.clone();
            inner.messages.push(ChatMessage::question(text));
            inner.messages.push(answer);
            inner.input.clear();

            inner.next_generation += 1;
            let generation = inner.next_generation;
            let cancel = CancellationToken::new();
            inner.active = Some(ActiveRequest {
                generation,
                cancel: cancel.clone(),
                answer_id: answer_id.clone(),
            });

            Some(PendingRequest {
                generation,
                cancel,
                answer_id,
                request: ProviderRequest {
                    text: text.to_string(),
                    history,
                    conversation_id: inner.conversation_id.clone(),
                    user: inner.chatbot_id.clone(),
                },
            })
        })
    }

    /// Drive an accepted request to its terminal state
    pub async fn run(&self, pending: PendingRequest) -> SendOutcome {
        let result = if self.options.streaming {
            self.run_streaming(&pending).await
        } else {
            self.run_blocking(&pending).await
        };

        match result {
            Ok(()) => SendOutcome::Completed,
            Err(ProviderError::Cancelled) => {
                tracing::debug!("Chat request {} cancelled", pending.generation);
                self.finish_interrupted(&pending, CANCELLED_NOTICE);
                SendOutcome::Cancelled
            }
            Err(e) => {
                tracing::error!("Chat request via {} failed: {}", self.provider.name(), e);
                self.finish_interrupted(&pending, ERROR_NOTICE);
                SendOutcome::Failed
            }
        }
    }

    async fn run_blocking(&self, pending: &PendingRequest) -> Result<(), ProviderError> {
        let reply = self
            .provider
            .send_message(&pending.request, &pending.cancel)
            .await?;

        let completion = Completion {
            conversation_id: reply.conversation_id,
            message_id: reply.message_id,
            suggestions: reply.suggestions,
        };
        self.complete(pending, reply.answer, completion)
            .ok_or(ProviderError::Cancelled)
    }

    async fn run_streaming(&self, pending: &PendingRequest) -> Result<(), ProviderError> {
        let mut stream = self
            .provider
            .send_message_stream(pending.request.clone(), pending.cancel.clone());
        let mut answer = String::new();

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Delta(text) => {
                    answer.push_str(&text);
                    self.apply_chunk(pending, &text)
                        .ok_or(ProviderError::Cancelled)?;
                }
                StreamEvent::Complete(completion) => {
                    return self
                        .complete(pending, answer, completion)
                        .ok_or(ProviderError::Cancelled);
                }
            }
        }

        tracing::warn!("Provider stream closed without a completion marker");
        self.complete(pending, answer, Completion::default())
            .ok_or(ProviderError::Cancelled)
    }

    fn apply_chunk(&self, pending: &PendingRequest, text: &str) -> Option<()> {
        self.mutate(|inner| {
            if !inner.is_current(pending.generation) {
                return None;
            }
            inner.transition(PhaseEvent::Chunk);

            let message = inner.message_mut(&pending.answer_id)?;
            if message.loading {
                message.loading = false;
                message.answer_timestamp = Some(Utc::now());
            }
            message.is_streaming = true;
            message
                .answer
                .get_or_insert_with(String::new)
                .push_str(text);
            Some(())
        })
    }

    fn complete(
        &self,
        pending: &PendingRequest,
        answer: String,
        completion: Completion,
    ) -> Option<()> {
        self.mutate(|inner| {
            if !inner.is_current(pending.generation) {
                return None;
            }
            inner.transition(PhaseEvent::Finish);
            inner.active = None;

            if let Some(id) = completion.conversation_id {
                inner.conversation_id = Some(id);
            }

            if let Some(message) = inner.message_mut(&pending.answer_id) {
                message.answer = Some(answer);
                message.loading = false;
                message.is_streaming = false;
                message.answer_timestamp = Some(Utc::now());
                message.suggestion_tags = completion.suggestions;
                message.remote_id = completion.message_id;
            }
            Some(())
        })
    }

    /// Release the slot after cancellation or failure. An abort already
    /// closed the placeholder; a failure still has to.
    fn finish_interrupted(&self, pending: &PendingRequest, notice: &str) {
        self.mutate(|inner| {
            if !inner.owns_slot(pending.generation) {
                return None;
            }
            inner.active = None;

            if inner.phase == RequestPhase::Aborting {
                inner.transition(PhaseEvent::Unwind);
                return Some(());
            }
            inner.transition(PhaseEvent::Finish);

            if let Some(message) = inner.message_mut(&pending.answer_id) {
                message.loading = false;
                message.is_streaming = false;
                message.interrupted = true;
                message.answer_timestamp = Some(Utc::now());
                message.answer = Some(match message.answer.take() {
                    Some(partial) if !partial.is_empty() => format!("{}\n\n{}", partial, notice),
                    _ => notice.to_string(),
                });
            }
            Some(())
        });
    }

    /// Cancel the in-flight request. Returns false when nothing was in
    /// flight, in which case state is untouched.
    pub fn abort_current_message(&self) -> bool {
        self.mutate(|inner| inner.abort_active().then_some(()))
            .is_some()
    }

    /// Drop all history and start a new logical conversation
    pub fn clear_messages(&self) {
        self.mutate(|inner| {
            inner.abort_active();
            inner.messages.clear();
            inner.conversation_id = None;
            Some(())
        });
    }

    pub fn set_config(&self, patch: ChatbotConfigPatch) {
        self.mutate(|inner| {
            inner.config.merge(patch);
            Some(())
        });
    }

    /// Push the prompt for a navigation path into the config. History is
    /// kept.
    pub fn apply_route(&self, prompts: &RoutePrompts, path: &str) -> ChatbotConfig {
        let patch = ChatbotConfigPatch::from(prompts.resolve(path));
        tracing::debug!("Applying route prompt for {}", path);
        self.mutate(|inner| {
            inner.config.merge(patch);
            Some(inner.config.clone())
        })
        .unwrap_or_default()
    }

    pub fn set_input(&self, text: impl Into<String>) {
        let text = text.into();
        self.mutate(|inner| {
            inner.input = text;
            Some(())
        });
    }

    pub fn set_open(&self, open: bool) {
        self.mutate(|inner| {
            inner.is_open = open;
            Some(())
        });
    }

    /// Flip the widget dialog and return the new state
    pub fn toggle_open(&self) -> bool {
        self.mutate(|inner| {
            inner.is_open = !inner.is_open;
            Some(inner.is_open)
        })
        .unwrap_or_default()
    }

    /// Record feedback on an answer
    pub fn set_liked(&self, message_id: &str, liked: Option<bool>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let message = inner
            .message_mut(message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;
        if message.question.is_some() {
            return Err(StoreError::NotAnAnswer(message_id.to_string()));
        }
        message.liked = liked;
        self.updates.send_replace(inner.snapshot());
        Ok(())
    }

    pub fn set_chatbot_id(&self, chatbot_id: String) {
        self.mutate(|inner| {
            inner.chatbot_id = chatbot_id;
            Some(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_stream::try_stream;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::conversation::{Theme, Turn};
    use crate::providers::{
        cancellable, MockConfig, MockProvider, ProviderReply, ProviderStream,
    };

    type Feed = mpsc::UnboundedReceiver<Result<StreamEvent, ProviderError>>;

    /// Provider whose responses are pushed by the test, one feed per call
    #[derive(Default)]
    struct ScriptedProvider {
        feeds: Mutex<VecDeque<Feed>>,
    }

    impl ScriptedProvider {
        fn script(&self) -> mpsc::UnboundedSender<Result<StreamEvent, ProviderError>> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.feeds.lock().push_back(rx);
            tx
        }

        fn next_feed(&self) -> Result<Feed, ProviderError> {
            self.feeds
                .lock()
                .pop_front()
                .ok_or_else(|| ProviderError::InvalidResponse("no scripted feed".to_string()))
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send_message(
            &self,
            _request: &ProviderRequest,
            cancel: &CancellationToken,
        ) -> Result<ProviderReply, ProviderError> {
            let mut feed = self.next_feed()?;
            let mut reply = ProviderReply::default();
            while let Some(event) = cancellable(cancel, feed.recv()).await? {
                match event? {
                    StreamEvent::Delta(text) => reply.answer.push_str(&text),
                    StreamEvent::Complete(done) => {
                        reply.conversation_id = done.conversation_id;
                        reply.suggestions = done.suggestions;
                        break;
                    }
                }
            }
            Ok(reply)
        }

        fn send_message_stream(
            &self,
            _request: ProviderRequest,
            cancel: CancellationToken,
        ) -> ProviderStream {
            let feed = self.next_feed();
            Box::pin(try_stream! {
                let mut feed = feed?;
                while let Some(event) = cancellable(&cancel, feed.recv()).await? {
                    yield event?;
                }
            })
        }
    }

    fn store_with(provider: Arc<dyn ChatProvider>, streaming: bool) -> Arc<ChatStore> {
        Arc::new(ChatStore::new(
            provider,
            StoreOptions {
                streaming,
                history_limit: 10,
            },
            "chatbot-test".to_string(),
            ChatbotConfig::default(),
        ))
    }

    fn scripted(streaming: bool) -> (Arc<ScriptedProvider>, Arc<ChatStore>) {
        let provider = Arc::new(ScriptedProvider::default());
        let store = store_with(provider.clone(), streaming);
        (provider, store)
    }

    fn questions(snapshot: &ChatSnapshot) -> Vec<String> {
        snapshot
            .messages
            .iter()
            .filter_map(|m| m.question.clone())
            .collect()
    }

    fn delta(text: &str) -> Result<StreamEvent, ProviderError> {
        Ok(StreamEvent::Delta(text.to_string()))
    }

    fn done(conversation_id: Option<&str>, suggestions: &[&str]) -> Result<StreamEvent, ProviderError> {
        Ok(StreamEvent::Complete(Completion {
            conversation_id: conversation_id.map(str::to_string),
            message_id: None,
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
        }))
    }

    #[test]
    fn test_phase_transitions() {
        use PhaseEvent::*;
        use RequestPhase::*;

        assert_eq!(Idle.transition(Begin).unwrap(), Sending);
        assert_eq!(Sending.transition(Chunk).unwrap(), Streaming);
        assert_eq!(Streaming.transition(Chunk).unwrap(), Streaming);
        assert_eq!(Streaming.transition(Finish).unwrap(), Idle);
        assert_eq!(Sending.transition(Abort).unwrap(), Aborting);
        assert_eq!(Aborting.transition(Unwind).unwrap(), Idle);
        assert_eq!(Aborting.transition(Begin).unwrap(), Sending);

        assert!(Sending.transition(Begin).is_err());
        assert!(Streaming.transition(Begin).is_err());
        assert!(Idle.transition(Abort).is_err());
        assert!(Idle.transition(Chunk).is_err());
        assert!(Aborting.transition(Chunk).is_err());
    }

    #[tokio::test]
    async fn test_streamed_answer_is_applied_in_order() {
        let (provider, store) = scripted(true);
        let feed = provider.script();
        feed.send(delta("Hel")).unwrap();
        feed.send(delta("lo")).unwrap();
        feed.send(done(Some("conv-1"), &["More?"])).unwrap();

        assert_eq!(store.send_message("hi").await, SendOutcome::Completed);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        let answer = &snapshot.messages[1];
        assert_eq!(answer.answer.as_deref(), Some("Hello"));
        assert!(!answer.loading);
        assert!(!answer.is_streaming);
        assert_eq!(answer.suggestion_tags, vec!["More?"]);
        assert_eq!(snapshot.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(snapshot.phase, RequestPhase::Idle);
    }

    #[tokio::test]
    async fn test_first_chunk_switches_to_streaming() {
        let (provider, store) = scripted(true);
        let feed = provider.script();
        let pending = store.begin_message("hi").unwrap();

        assert!(store.snapshot().is_loading);
        assert!(store.snapshot().messages[1].loading);

        let (outcome, _) = futures::join!(store.run(pending), async {
            feed.send(delta("par")).unwrap();
            while !store.snapshot().is_streaming {
                tokio::task::yield_now().await;
            }
            let snapshot = store.snapshot();
            let answer = &snapshot.messages[1];
            assert!(!answer.loading);
            assert!(answer.is_streaming);
            assert_eq!(answer.answer.as_deref(), Some("par"));
            assert!(!snapshot.is_loading);

            feed.send(done(None, &[])).unwrap();
        });

        assert_eq!(outcome, SendOutcome::Completed);
        assert!(!store.snapshot().is_streaming);
    }

    #[tokio::test]
    async fn test_rapid_sends_only_first_accepted() {
        let (_provider, store) = scripted(true);

        let first = store.begin_message("a");
        assert!(first.is_some());
        for text in ["a", "b", "c"] {
            assert!(store.begin_message(text).is_none());
        }

        let snapshot = store.snapshot();
        assert_eq!(questions(&snapshot), vec!["a"]);
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(
            snapshot.messages.iter().filter(|m| m.loading).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_back_to_back_send_message() {
        let (provider, store) = scripted(true);
        let feed = provider.script();

        let (first, second, _) = futures::join!(
            store.send_message("a"),
            store.send_message("b"),
            async {
                assert_eq!(questions(&store.snapshot()), vec!["a"]);
                feed.send(delta("ok")).unwrap();
                feed.send(done(None, &[])).unwrap();
            }
        );

        assert_eq!(first, SendOutcome::Completed);
        assert_eq!(second, SendOutcome::Rejected);
        assert_eq!(questions(&store.snapshot()), vec!["a"]);

        // the slot is free again once the first completes
        let feed = provider.script();
        feed.send(done(None, &[])).unwrap();
        assert_eq!(store.send_message("b").await, SendOutcome::Completed);
        assert_eq!(questions(&store.snapshot()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected() {
        let (_provider, store) = scripted(true);
        assert_eq!(store.send_message("   ").await, SendOutcome::Rejected);
        assert!(store.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn test_abort_with_nothing_in_flight_is_noop() {
        let (_provider, store) = scripted(true);
        store.set_input("draft");
        let before = store.snapshot();
        let mut updates = store.subscribe();
        updates.borrow_and_update();

        assert!(!store.abort_current_message());
        assert_eq!(store.snapshot(), before);
        assert!(!updates.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_abort_before_first_chunk() {
        let (provider, store) = scripted(true);
        let _feed = provider.script();
        let pending = store.begin_message("slow question").unwrap();

        assert!(store.abort_current_message());

        let snapshot = store.snapshot();
        let answer = snapshot.messages.last().unwrap();
        assert!(!answer.loading);
        assert!(!answer.is_streaming);
        assert!(answer.interrupted);
        assert_eq!(answer.answer.as_deref(), Some(CANCELLED_NOTICE));
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.phase, RequestPhase::Aborting);

        assert_eq!(store.run(pending).await, SendOutcome::Cancelled);
        let after = store.snapshot();
        assert_eq!(after.phase, RequestPhase::Idle);
        assert_eq!(after.messages, snapshot.messages);

        // second abort has nothing to cancel
        assert!(!store.abort_current_message());
    }

    #[tokio::test]
    async fn test_abort_mid_stream_keeps_partial_answer() {
        let (provider, store) = scripted(true);
        let feed = provider.script();
        let pending = store.begin_message("hi").unwrap();

        let (outcome, _) = futures::join!(store.run(pending), async {
            feed.send(delta("partial")).unwrap();
            while !store.snapshot().is_streaming {
                tokio::task::yield_now().await;
            }
            assert!(store.abort_current_message());
            // arrives after the abort and must be dropped
            let _ = feed.send(delta(" late"));
        });

        assert_eq!(outcome, SendOutcome::Cancelled);
        let snapshot = store.snapshot();
        let answer = &snapshot.messages[1];
        assert_eq!(answer.answer.as_deref(), Some("partial"));
        assert!(answer.interrupted);
        assert!(!answer.is_streaming);
        assert_eq!(snapshot.phase, RequestPhase::Idle);
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_touch_newer_request() {
        let (provider, store) = scripted(true);
        let _first_feed = provider.script();
        let stale = store.begin_message("first").unwrap();
        assert!(store.abort_current_message());

        let fresh = store.begin_message("second");
        assert!(fresh.is_some());

        assert_eq!(store.run(stale).await, SendOutcome::Cancelled);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.phase, RequestPhase::Sending);
        let answer = snapshot.messages.last().unwrap();
        assert!(answer.loading);
        assert!(answer.answer.is_none());
    }

    #[tokio::test]
    async fn test_failure_becomes_error_notice() {
        let (provider, store) = scripted(true);
        let feed = provider.script();
        feed.send(Err(ProviderError::Http {
            status: 500,
            message: "upstream down".to_string(),
        }))
        .unwrap();

        assert_eq!(store.send_message("hi").await, SendOutcome::Failed);

        let snapshot = store.snapshot();
        let answer = &snapshot.messages[1];
        assert_eq!(answer.answer.as_deref(), Some(ERROR_NOTICE));
        assert!(answer.interrupted);
        assert!(!answer.loading);
        assert_eq!(snapshot.phase, RequestPhase::Idle);

        let feed = provider.script();
        feed.send(done(None, &[])).unwrap();
        assert_eq!(store.send_message("retry").await, SendOutcome::Completed);
    }

    #[tokio::test]
    async fn test_failure_after_partial_keeps_content() {
        let (provider, store) = scripted(true);
        let feed = provider.script();
        feed.send(delta("Half an ans")).unwrap();
        feed.send(Err(ProviderError::Stream {
            code: "quota".to_string(),
            message: "Quota exceeded".to_string(),
        }))
        .unwrap();

        assert_eq!(store.send_message("hi").await, SendOutcome::Failed);
        let answer = store.snapshot().messages[1].answer.clone().unwrap();
        assert!(answer.starts_with("Half an ans"));
        assert!(answer.ends_with(ERROR_NOTICE));
    }

    #[tokio::test]
    async fn test_clear_resets_conversation() {
        let (provider, store) = scripted(true);
        let feed = provider.script();
        feed.send(done(Some("conv-9"), &[])).unwrap();
        store.send_message("hi").await;
        assert_eq!(store.snapshot().conversation_id.as_deref(), Some("conv-9"));

        // the assigned conversation is reused by the next send
        let _feed = provider.script();
        let pending = store.begin_message("again").unwrap();
        assert_eq!(pending.request.conversation_id.as_deref(), Some("conv-9"));
        assert!(store.abort_current_message());
        store.run(pending).await;

        store.clear_messages();
        let snapshot = store.snapshot();
        assert!(snapshot.messages.is_empty());
        assert!(snapshot.conversation_id.is_none());

        // clearing an empty store is fine too
        store.clear_messages();
        assert!(store.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn test_clear_during_request_aborts_it() {
        let (provider, store) = scripted(true);
        let feed = provider.script();
        let pending = store.begin_message("hi").unwrap();

        store.clear_messages();
        let _ = feed.send(delta("too late"));

        assert_eq!(store.run(pending).await, SendOutcome::Cancelled);
        let snapshot = store.snapshot();
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.phase, RequestPhase::Idle);
    }

    #[tokio::test]
    async fn test_history_is_sent_with_next_request() {
        let (provider, store) = scripted(true);
        let feed = provider.script();
        feed.send(delta("Use the notes page.")).unwrap();
        feed.send(done(None, &[])).unwrap();
        store.send_message("where are notes?").await;

        let pending = store.begin_message("thanks").unwrap();
        assert_eq!(
            pending.request.history,
            vec![
                Turn::user("where are notes?"),
                Turn::assistant("Use the notes page."),
            ]
        );
        assert_eq!(pending.request.user, "chatbot-test");
        assert_eq!(pending.request.text, "thanks");
    }

    #[tokio::test]
    async fn test_blocking_mode() {
        let (provider, store) = scripted(false);
        let feed = provider.script();
        feed.send(delta("Whole answer")).unwrap();
        feed.send(Ok(StreamEvent::Complete(Completion {
            conversation_id: Some("conv-2".to_string()),
            message_id: Some("msg-2".to_string()),
            suggestions: vec!["Next?".to_string()],
        })))
        .unwrap();

        assert_eq!(store.send_message("hi").await, SendOutcome::Completed);
        let snapshot = store.snapshot();
        let answer = &snapshot.messages[1];
        assert_eq!(answer.answer.as_deref(), Some("Whole answer"));
        assert_eq!(answer.suggestion_tags, vec!["Next?"]);
        assert_eq!(answer.remote_id.as_deref(), Some("msg-2"));
        assert!(!answer.is_streaming);
        assert_eq!(snapshot.conversation_id.as_deref(), Some("conv-2"));
    }

    #[tokio::test]
    async fn test_blocking_abort() {
        let (provider, store) = scripted(false);
        let _feed = provider.script();
        let pending = store.begin_message("hi").unwrap();
        assert!(store.abort_current_message());
        assert_eq!(store.run(pending).await, SendOutcome::Cancelled);
        assert_eq!(
            store.snapshot().messages[1].answer.as_deref(),
            Some(CANCELLED_NOTICE)
        );
    }

    #[tokio::test]
    async fn test_send_clears_input() {
        let (provider, store) = scripted(true);
        let feed = provider.script();
        feed.send(done(None, &[])).unwrap();
        store.set_input("hello");
        assert_eq!(store.snapshot().input, "hello");
        store.send_message("hello").await;
        assert_eq!(store.snapshot().input, "");
    }

    #[test]
    fn test_set_config_merges() {
        let (_provider, store) = scripted(true);
        store.set_config(ChatbotConfigPatch {
            theme: Some(Theme::Dark),
            ..Default::default()
        });
        store.set_config(ChatbotConfigPatch {
            title: Some("Custom".to_string()),
            ..Default::default()
        });

        let config = store.snapshot().config;
        assert_eq!(config.theme, Theme::Dark);
        assert_eq!(config.title, "Custom");
    }

    #[tokio::test]
    async fn test_apply_route_keeps_history() {
        let (provider, store) = scripted(true);
        let feed = provider.script();
        feed.send(done(None, &[])).unwrap();
        store.send_message("hi").await;

        let config = store.apply_route(&RoutePrompts::builtin(), "/monitor/notes");
        assert_eq!(config.title, "Notes Assistant");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.config.title, "Notes Assistant");
        assert_eq!(snapshot.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_set_liked() {
        let (provider, store) = scripted(true);
        let feed = provider.script();
        feed.send(done(None, &[])).unwrap();
        store.send_message("hi").await;

        let snapshot = store.snapshot();
        let question_id = snapshot.messages[0].id.clone();
        let answer_id = snapshot.messages[1].id.clone();

        store.set_liked(&answer_id, Some(true)).unwrap();
        assert_eq!(store.snapshot().messages[1].liked, Some(true));
        store.set_liked(&answer_id, None).unwrap();
        assert_eq!(store.snapshot().messages[1].liked, None);

        assert!(matches!(
            store.set_liked(&question_id, Some(false)),
            Err(StoreError::NotAnAnswer(_))
        ));
        assert!(matches!(
            store.set_liked("missing", Some(false)),
            Err(StoreError::MessageNotFound(_))
        ));
    }

    #[test]
    fn test_open_toggle_and_chatbot_id() {
        let (_provider, store) = scripted(true);
        assert!(!store.snapshot().is_open);
        assert!(store.toggle_open());
        store.set_open(false);
        assert!(!store.snapshot().is_open);

        store.set_chatbot_id("chatbot-new".to_string());
        assert_eq!(store.snapshot().chatbot_id, "chatbot-new");
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let (_provider, store) = scripted(true);
        let mut updates = store.subscribe();

        store.set_input("typing");
        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().input, "typing");
    }

    #[tokio::test]
    async fn test_mock_provider_end_to_end() {
        let provider = Arc::new(MockProvider::new(MockConfig {
            delay_min_ms: 0,
            delay_max_ms: 0,
        }));
        let store = store_with(provider, true);

        assert_eq!(store.send_message("How does SAML work?").await, SendOutcome::Completed);
        let snapshot = store.snapshot();
        let answer = snapshot.messages[1].answer.clone().unwrap();
        assert!(answer.contains("SAML single sign-on"));
        assert!(snapshot.conversation_id.unwrap().starts_with("mock-"));
        assert!(!snapshot.messages[1].suggestion_tags.is_empty());
    }
}

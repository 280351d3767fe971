//! Canned-response provider used when no live backend is configured

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::{
    cancellable, ChatProvider, Completion, ProviderError, ProviderReply, ProviderRequest,
    ProviderStream, StreamEvent,
};

/// Pause between streamed words
const CHUNK_DELAY_MS: u64 = 40;

#[derive(Debug, Clone, Copy)]
pub struct MockConfig {
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            delay_min_ms: 500,
            delay_max_ms: 1500,
        }
    }
}

struct CannedResponse {
    keywords: &'static [&'static str],
    answer: &'static str,
    suggestions: &'static [&'static str],
}

/// Checked in order; the first entry with a matching keyword wins
const CANNED: &[CannedResponse] = &[
    CannedResponse {
        keywords: &["saml"],
        answer: "DevConsole signs you in through SAML single sign-on. The identity provider \
                 posts a signed assertion to the console, which validates the signature, \
                 maps your groups to console roles and starts a session. If login loops, \
                 check that the assertion consumer URL and the certificate in the IdP \
                 metadata match the console settings.",
        suggestions: &[
            "Which SAML attributes are required?",
            "How do I rotate the IdP certificate?",
        ],
    },
    CannedResponse {
        keywords: &["bookmark"],
        answer: "Bookmarks live in collections. Drag a bookmark to reorder it or drop it onto \
                 another collection to move it; order is saved automatically.",
        suggestions: &["How do I create a collection?", "Can I import browser bookmarks?"],
    },
    CannedResponse {
        keywords: &["note"],
        answer: "Notes support Markdown. Use the search box on the notes page to filter by \
                 title or content, and pin important notes to keep them on top.",
        suggestions: &["How do I pin a note?", "Can notes be shared?"],
    },
    CannedResponse {
        keywords: &["script"],
        answer: "The scripts page stores reusable shell snippets. Each script has a name, a \
                 description and a body you can copy with one click.",
        suggestions: &["How do I add a script?", "Can I tag scripts?"],
    },
    CannedResponse {
        keywords: &["s3", "bucket", "storage"],
        answer: "The storage browser works with any S3-compatible endpoint. Pick a bucket, \
                 browse prefixes like folders, and upload, download or delete objects.",
        suggestions: &["How do I generate a presigned URL?", "Which endpoints are supported?"],
    },
    CannedResponse {
        keywords: &["notion"],
        answer: "The Notion view reads pages from the connected workspace. Make sure the \
                 integration is shared with the pages you want to see.",
        suggestions: &["How do I connect a workspace?"],
    },
    CannedResponse {
        keywords: &["backup", "postgres"],
        answer: "Backups are stored in PostgreSQL. Each entry records the source, size and \
                 timestamp; restore by selecting an entry and confirming.",
        suggestions: &["How often do backups run?", "How do I restore a backup?"],
    },
];

static DEFAULT_RESPONSE: CannedResponse = CannedResponse {
    keywords: &[],
    answer: "I'm the DevConsole assistant running in demo mode. Ask me about bookmarks, notes, \
             scripts, S3 storage, Notion, backups or SAML login.",
    suggestions: &["What can DevConsole do?", "How does SAML login work?"],
};

fn select_response(text: &str) -> &'static CannedResponse {
    let text = text.to_lowercase();
    CANNED
        .iter()
        .find(|r| r.keywords.iter().any(|k| text.contains(k)))
        .unwrap_or(&DEFAULT_RESPONSE)
}

/// Deterministic keyword-matched answers with simulated latency
pub struct MockProvider {
    config: MockConfig,
}

impl MockProvider {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    fn latency(&self) -> Duration {
        let min = self.config.delay_min_ms.min(self.config.delay_max_ms);
        let max = self.config.delay_min_ms.max(self.config.delay_max_ms);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

fn conversation_for(request: &ProviderRequest) -> String {
    request
        .conversation_id
        .clone()
        .unwrap_or_else(|| format!("mock-{}", uuid::Uuid::new_v4()))
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send_message(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderReply, ProviderError> {
        let delay = self.latency();
        cancellable(cancel, tokio::time::sleep(delay)).await?;

        let response = select_response(&request.text);
        Ok(ProviderReply {
            answer: response.answer.to_string(),
            conversation_id: Some(conversation_for(request)),
            message_id: Some(uuid::Uuid::new_v4().to_string()),
            suggestions: response.suggestions.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn send_message_stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> ProviderStream {
        let delay = self.latency();
        let chunk_delay = if self.config.delay_max_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(CHUNK_DELAY_MS)
        };

        Box::pin(try_stream! {
            cancellable(&cancel, tokio::time::sleep(delay)).await?;

            let response = select_response(&request.text);
            for word in response.answer.split_inclusive(' ') {
                yield StreamEvent::Delta(word.to_string());
                cancellable(&cancel, tokio::time::sleep(chunk_delay)).await?;
            }

            yield StreamEvent::Complete(Completion {
                conversation_id: Some(conversation_for(&request)),
                message_id: Some(uuid::Uuid::new_v4().to_string()),
                suggestions: response.suggestions.iter().map(|s| s.to_string()).collect(),
            });
        })
    }
}

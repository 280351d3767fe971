//! DevConsole Chat - assistant backend for the DevConsole widget
//!
//! Owns the chat conversation, streams answers from the configured AI
//! provider and frames the chat for whichever console page is open.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod conversation;
mod core;
mod providers;
mod routes;

use crate::config::{Config, RoutePrompts};
use crate::conversation::{ChatbotConfig, ChatbotConfigPatch};
use crate::core::{ChatStore, SessionStore, StoreOptions};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<ChatStore>,
    pub session: Arc<SessionStore>,
    pub prompts: Arc<RoutePrompts>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devconsole_chat=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let session = Arc::new(SessionStore::new(&config.database_path()).await?);
    let chatbot_id = session.load_or_create_chatbot_id().await?;

    let prompts = match config.prompts_file {
        Some(ref path) => {
            let prompts = RoutePrompts::from_file(path).await?;
            tracing::info!("📝 Loaded {} route prompt(s) from {}", prompts.routes.len(), path.display());
            prompts
        }
        None => RoutePrompts::builtin(),
    };

    let provider = providers::from_config(&config)?;

    let mut chatbot_config = ChatbotConfig::default();
    chatbot_config.merge(ChatbotConfigPatch::from(&prompts.default));

    let store = Arc::new(ChatStore::new(
        provider,
        StoreOptions {
            streaming: config.streaming,
            history_limit: config.history_limit,
        },
        chatbot_id,
        chatbot_config,
    ));

    let state = AppState {
        config,
        store,
        session,
        prompts: Arc::new(prompts),
    };

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("🔥 DevConsole chat running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

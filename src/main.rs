use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ragserve::{
    build_app,
    config::Config,
    conversation::{client::HttpConversationClient, ConversationDelegate},
    embeddings::EmbeddingDelegate,
    inference::SentenceEmbedder,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    // -----------------------------
    // Delegates
    // -----------------------------
    let embedder: Option<Arc<dyn EmbeddingDelegate>> = match config.embed.clone() {
        Some(embed_cfg) => {
            // Model load is blocking file IO plus weight mmap.
            let embedder = tokio::task::spawn_blocking(move || SentenceEmbedder::load(&embed_cfg))
                .await
                .context("embedding model loader panicked")??;
            Some(Arc::new(embedder))
        }
        None => {
            warn!("EMBED_ENABLED=false, /embed will answer 503");
            None
        }
    };

    let chat: Option<Arc<dyn ConversationDelegate>> = match &config.chat {
        Some(chat_cfg) => {
            info!("conversational backend → {}", chat_cfg.backend_url);
            Some(Arc::new(HttpConversationClient::new(chat_cfg)?))
        }
        None => {
            warn!("CHAT_BACKEND_URL not set, /metaai will answer 503");
            None
        }
    };

    let app = build_app(AppState::new(embedder, chat));

    let addr = config.bind_addr();
    info!("🌐 HTTP listening on http://{addr}");
    info!("🧮 Embeddings at http://{addr}/embed");
    info!("💬 Prompts at http://{addr}/metaai");

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

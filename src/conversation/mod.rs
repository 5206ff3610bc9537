use anyhow::Result;
use async_trait::async_trait;
use axum::{routing::post, Router};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::state::AppState;

pub mod client;
pub mod dto;
pub mod handler;

/// One record produced by the conversational backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PromptReply {
    pub message: String,
    #[serde(default)]
    pub sources: Vec<serde_json::Value>,
}

/// `prompt(message, stream?) -> {message, sources}`.
#[async_trait]
pub trait ConversationDelegate: Send + Sync {
    async fn prompt(&self, message: &str) -> Result<PromptReply>;

    /// Starts a streamed reply. Records arrive on the returned bounded channel in
    /// backend order; the channel closes after the last record or right after an
    /// `Err`. Dropping the receiver stops the producer.
    async fn prompt_stream(&self, message: &str) -> Result<mpsc::Receiver<Result<PromptReply>>>;
}

pub fn router() -> Router<AppState> {
    Router::new().route("/metaai", post(handler::prompt_handler))
}

use std::sync::Arc;

use crate::conversation::ConversationDelegate;
use crate::embeddings::EmbeddingDelegate;
use crate::error::ApiError;

/// Delegates built once at startup and shared read-only by every request.
#[derive(Clone)]
pub struct AppState {
    pub embedder: Option<Arc<dyn EmbeddingDelegate>>,
    pub chat: Option<Arc<dyn ConversationDelegate>>,
}

impl AppState {
    pub fn new(
        embedder: Option<Arc<dyn EmbeddingDelegate>>,
        chat: Option<Arc<dyn ConversationDelegate>>,
    ) -> Self {
        Self { embedder, chat }
    }

    pub fn embedder(&self) -> Result<Arc<dyn EmbeddingDelegate>, ApiError> {
        self.embedder
            .clone()
            .ok_or(ApiError::DelegateUnavailable("Embedding model"))
    }

    pub fn chat(&self) -> Result<Arc<dyn ConversationDelegate>, ApiError> {
        self.chat
            .clone()
            .ok_or(ApiError::DelegateUnavailable("Conversational backend"))
    }
}

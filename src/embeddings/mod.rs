use anyhow::Result;
use axum::{routing::post, Router};

use crate::state::AppState;

pub mod dto;
pub mod handler;

/// Maps text to fixed-length vectors. Called from a blocking worker thread.
pub trait EmbeddingDelegate: Send + Sync {
    fn model_id(&self) -> &str;

    /// Output dimensionality, fixed for the lifetime of the delegate.
    fn dimensions(&self) -> usize;

    /// Returns one vector per input text, in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub fn router() -> Router<AppState> {
    Router::new().route("/embed", post(handler::embed_handler))
}

use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use tracing::info;
use uuid::Uuid;

use super::dto::{EmbedBatch, EmbedRequest, EmbedResponse};
use super::EmbeddingDelegate;
use crate::{error::ApiError, state::AppState};

pub async fn embed_handler(
    State(state): State<AppState>,
    payload: Result<Json<EmbedRequest>, JsonRejection>,
) -> Result<Json<EmbedResponse>, ApiError> {
    let Json(req) = payload?;
    let batch = req.into_batch()?;
    let embedder = state.embedder()?;

    let request_id = Uuid::new_v4();
    info!(
        %request_id,
        texts = batch.texts.len(),
        model = embedder.model_id(),
        "embed request"
    );

    run_embed_job(embedder, batch).await.map(Json)
}

async fn run_embed_job(
    service: Arc<dyn EmbeddingDelegate>,
    batch: EmbedBatch,
) -> Result<EmbedResponse, ApiError> {
    let EmbedBatch { texts, scalar } = batch;
    let expected = texts.len();
    let dims = service.dimensions();

    let mut embeddings = tokio::task::spawn_blocking(move || service.embed(&texts))
        .await
        .map_err(|err| anyhow!("embedding worker panicked: {err}"))??;

    if embeddings.len() != expected {
        return Err(anyhow!(
            "embedding delegate returned {} vectors for {expected} texts",
            embeddings.len()
        )
        .into());
    }
    if let Some(bad) = embeddings.iter().find(|v| v.len() != dims) {
        return Err(anyhow!(
            "embedding delegate returned a {}-dim vector, expected {dims}",
            bad.len()
        )
        .into());
    }

    if scalar {
        if let Some(vector) = embeddings.pop() {
            return Ok(EmbedResponse::Single(vector));
        }
    }
    Ok(EmbedResponse::Batch(embeddings))
}

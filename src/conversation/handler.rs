use anyhow::Result;
use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use super::dto::{PromptRequest, PromptResponse, StreamEvent};
use super::PromptReply;
use crate::{error::ApiError, state::AppState};

pub const NDJSON: &str = "application/x-ndjson";

pub async fn prompt_handler(
    State(state): State<AppState>,
    payload: Result<Json<PromptRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    let prompt = req.validated_prompt()?;
    let chat = state.chat()?;

    let request_id = Uuid::new_v4();
    info!(%request_id, stream = req.stream, chars = prompt.len(), "prompt request");

    if req.stream {
        let mut rx = chat.prompt_stream(prompt).await?;
        // Headers go out with the first record, so a failure here is still a plain 500.
        let first = match rx.recv().await {
            Some(Ok(reply)) => Some(reply),
            Some(Err(err)) => return Err(err.into()),
            None => None,
        };
        let mut response = Response::new(ndjson_body(first, rx, request_id));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON));
        Ok(response)
    } else {
        let reply = chat.prompt(prompt).await?;
        Ok((StatusCode::OK, Json(PromptResponse::from(reply))).into_response())
    }
}

struct StreamState {
    rx: mpsc::Receiver<Result<PromptReply>>,
    pending: Option<PromptReply>,
    sent: usize,
}

impl StreamState {
    async fn next(&mut self) -> Option<Result<PromptReply>> {
        match self.pending.take() {
            Some(reply) => Some(Ok(reply)),
            None => self.rx.recv().await,
        }
    }
}

/// One JSON record per line, then `{"done":true}`. A delegate error ends the
/// body with an `{"error":..}` line and no done marker.
fn ndjson_body(
    first: Option<PromptReply>,
    rx: mpsc::Receiver<Result<PromptReply>>,
    request_id: Uuid,
) -> Body {
    let start = StreamState {
        rx,
        pending: first,
        sent: 0,
    };
    let lines = stream::unfold(Some(start), move |state| async move {
        let mut state = state?;
        match state.next().await {
            Some(Ok(reply)) => {
                state.sent += 1;
                Some((encode_line(&PromptResponse::from(reply)), Some(state)))
            }
            Some(Err(err)) => {
                warn!(%request_id, chunks = state.sent, "prompt stream failed: {err:#}");
                Some((encode_line(&StreamEvent::error("stream interrupted")), None))
            }
            None => {
                info!(%request_id, chunks = state.sent, "prompt stream finished");
                Some((encode_line(&StreamEvent::done()), None))
            }
        }
    });
    Body::from_stream(lines)
}

fn encode_line<T: Serialize>(value: &T) -> serde_json::Result<Bytes> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_lines_are_newline_terminated_json() {
        let line = encode_line(&StreamEvent::done()).unwrap();
        assert_eq!(&line[..], b"{\"done\":true}\n");
    }
}

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE, USER_AGENT};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, warn};

use super::{ConversationDelegate, PromptReply};
use crate::config::ChatConfig;

/// Talks to a hosted conversational backend over HTTP.
///
/// The backend receives `{"message": .., "stream": ..}` and answers with a
/// `{message, sources}` record, or for streams, one record per line (bare JSON
/// or SSE `data:` lines).
pub struct HttpConversationClient {
    http: reqwest::Client,
    url: String,
    stream_buffer: usize,
}

impl HttpConversationClient {
    pub fn new(cfg: &ChatConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("ragserve/", env!("CARGO_PKG_VERSION"))),
        );
        if let Some(token) = &cfg.auth_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| anyhow!("Invalid CHAT_AUTH_TOKEN header value: {e}"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(cookie) = &cfg.cookie {
            let mut value = HeaderValue::from_str(cookie)
                .map_err(|e| anyhow!("Invalid CHAT_COOKIE header value: {e}"))?;
            value.set_sensitive(true);
            headers.insert(COOKIE, value);
        }

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(ms) = cfg.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }

        Ok(Self {
            http: builder.build().context("failed to build HTTP client")?,
            url: cfg.backend_url.clone(),
            stream_buffer: cfg.stream_buffer,
        })
    }

    async fn send(&self, message: &str, stream: bool) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(&self.url)
            .json(&json!({ "message": message, "stream": stream }))
            .send()
            .await
            .with_context(|| format!("failed to reach conversational backend at {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unable to read response body>".to_string());
            bail!("conversational backend returned {status}: {body}");
        }
        Ok(response)
    }
}

#[async_trait]
impl ConversationDelegate for HttpConversationClient {
    async fn prompt(&self, message: &str) -> Result<PromptReply> {
        let body = self
            .send(message, false)
            .await?
            .text()
            .await
            .context("failed to read conversational backend response")?;
        parse_reply_body(&body)
    }

    async fn prompt_stream(&self, message: &str) -> Result<mpsc::Receiver<Result<PromptReply>>> {
        let response = self.send(message, true).await?;
        let (tx, rx) = mpsc::channel(self.stream_buffer);

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = LineDecoder::default();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx
                            .send(Err(anyhow!("conversational stream broke: {err}")))
                            .await;
                        return;
                    }
                };
                for line in decoder.push(&chunk) {
                    if !forward_line(&tx, &line).await {
                        return;
                    }
                }
            }
            if let Some(line) = decoder.finish() {
                forward_line(&tx, &line).await;
            }
        });

        Ok(rx)
    }
}

/// Returns `false` once the producer should stop.
async fn forward_line(tx: &mpsc::Sender<Result<PromptReply>>, line: &str) -> bool {
    let Some(record) = parse_record(line) else {
        return true;
    };
    let failed = record.is_err();
    if tx.send(record).await.is_err() {
        debug!("stream receiver dropped, abandoning upstream reply");
        return false;
    }
    !failed
}

/// Parses one streamed line. `None` for keep-alives, SSE metadata and `[DONE]`.
pub fn parse_record(line: &str) -> Option<Result<PromptReply>> {
    let line = line.trim();
    if line.is_empty()
        || line.starts_with(':')
        || line.starts_with("event:")
        || line.starts_with("id:")
        || line.starts_with("retry:")
    {
        return None;
    }
    let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    Some(
        serde_json::from_str(payload)
            .with_context(|| format!("malformed reply record: {payload}")),
    )
}

/// Parses a non-streamed body: one JSON record, or the last record of a line stream.
pub fn parse_reply_body(raw: &str) -> Result<PromptReply> {
    if let Ok(reply) = serde_json::from_str::<PromptReply>(raw.trim()) {
        return Ok(reply);
    }
    let mut last = None;
    for record in raw.lines().filter_map(parse_record) {
        match record {
            Ok(reply) => last = Some(reply),
            Err(err) => warn!("skipping reply line: {err:#}"),
        }
    }
    last.ok_or_else(|| anyhow!("conversational backend response did not contain a reply"))
}

/// Splits a byte stream into trimmed, non-empty text lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Flushes a trailing line that had no newline.
    pub fn finish(self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.buffer).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

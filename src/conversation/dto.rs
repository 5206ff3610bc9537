use serde::{Deserialize, Serialize};

use super::PromptReply;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl PromptRequest {
    pub fn validated_prompt(&self) -> Result<&str, ApiError> {
        match self.prompt.as_deref() {
            Some(prompt) if !prompt.is_empty() => Ok(prompt),
            _ => Err(ApiError::MissingField("Prompt")),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct PromptResponse {
    pub response: String,
    pub sources: Vec<serde_json::Value>,
}

impl From<PromptReply> for PromptResponse {
    fn from(reply: PromptReply) -> Self {
        Self {
            response: reply.message,
            sources: reply.sources,
        }
    }
}

/// Out-of-band lines in a streamed reply.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Done { done: bool },
    Error { error: String },
}

impl StreamEvent {
    pub fn done() -> Self {
        Self::Done { done: true }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_validation() {
        let ok: PromptRequest = serde_json::from_str(r#"{"prompt":"hi"}"#).unwrap();
        assert_eq!(ok.validated_prompt().unwrap(), "hi");
        assert!(!ok.stream);

        let spaces: PromptRequest = serde_json::from_str(r#"{"prompt":"  "}"#).unwrap();
        assert_eq!(spaces.validated_prompt().unwrap(), "  ");

        for raw in [r#"{}"#, r#"{"prompt":""}"#, r#"{"prompt":null}"#] {
            let req: PromptRequest = serde_json::from_str(raw).unwrap();
            let err = req.validated_prompt().unwrap_err();
            assert_eq!(err.to_string(), "Prompt is required", "input: {raw}");
        }
    }

    #[test]
    fn reply_maps_message_to_response_field() {
        let reply: PromptReply = serde_json::from_str(r#"{"message":"pong"}"#).unwrap();
        let body = serde_json::to_value(PromptResponse::from(reply)).unwrap();
        assert_eq!(body, serde_json::json!({"response": "pong", "sources": []}));
    }

    #[test]
    fn stream_events_serialize_as_plain_objects() {
        assert_eq!(
            serde_json::to_string(&StreamEvent::done()).unwrap(),
            r#"{"done":true}"#
        );
        assert_eq!(
            serde_json::to_string(&StreamEvent::error("stream interrupted")).unwrap(),
            r#"{"error":"stream interrupted"}"#
        );
    }
}

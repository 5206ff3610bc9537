use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TextInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    #[serde(default)]
    pub text: Option<TextInput>,
}

/// Validated request: the texts to embed plus whether the caller sent a bare string.
#[derive(Debug, PartialEq)]
pub struct EmbedBatch {
    pub texts: Vec<String>,
    pub scalar: bool,
}

impl EmbedRequest {
    pub fn into_batch(self) -> Result<EmbedBatch, ApiError> {
        // Only the field itself must be non-empty; array elements pass through as given.
        match self.text {
            Some(TextInput::One(text)) if !text.is_empty() => Ok(EmbedBatch {
                texts: vec![text],
                scalar: true,
            }),
            Some(TextInput::Many(texts)) if !texts.is_empty() => Ok(EmbedBatch {
                texts,
                scalar: false,
            }),
            _ => Err(ApiError::MissingField("Text")),
        }
    }
}

/// A bare string yields one vector; an array yields a vector per element.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum EmbedResponse {
    Single(Vec<f32>),
    Batch(Vec<Vec<f32>>),
}

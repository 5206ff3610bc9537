use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{0}")]
    InvalidBody(String),

    #[error("{0} is not configured")]
    DelegateUnavailable(&'static str),

    #[error("delegate failed: {0:#}")]
    DelegateFailure(#[from] anyhow::Error),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidBody(rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingField(_) | Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Self::DelegateUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DelegateFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            // Delegate errors never leak into the body.
            Self::DelegateFailure(err) => {
                error!("delegate failure: {err:#}");
                status.into_response()
            }
            other => (
                status,
                Json(ErrorResponse {
                    error: other.to_string(),
                }),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_message_matches_wire_contract() {
        assert_eq!(ApiError::MissingField("Text").to_string(), "Text is required");
        assert_eq!(
            ApiError::MissingField("Prompt").to_string(),
            "Prompt is required"
        );
    }

    #[test]
    fn status_codes_per_kind() {
        assert_eq!(
            ApiError::MissingField("Text").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::DelegateUnavailable("Conversational backend").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

//! Transport-level webhook errors
//!
//! These are failures to produce an admission decision at all. A denial is
//! not an error: it is a normal review with `allowed: false`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::validate::AdmissionError;

/// Error type for webhook handlers
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The request could not be understood (body, content type, kind, verb)
    #[error("{0}")]
    BadRequest(String),

    /// An internal invariant was violated or the response could not be encoded
    #[error("internal error: {0}")]
    Internal(String),
}

impl WebhookError {
    /// Create a bad request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// HTTP status returned to the API server
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AdmissionError> for WebhookError {
    fn from(e: AdmissionError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

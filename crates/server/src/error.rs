use std::fmt::{self, Display};

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chat_relay_model::{ErrorKind, ModelProviderError};
use serde_json::json;
use thiserror::Error;

/// A model backend failure with the provider's type erased.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendError {
    message: String,
    kind: ErrorKind,
}

impl BackendError {
    pub(crate) fn from_provider<E: ModelProviderError>(err: E) -> Self {
        Self {
            message: err.to_string(),
            kind: err.kind(),
        }
    }

    /// Returns the error message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the kind reported by the provider.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BackendError {}

/// Errors answered before any byte of the stream is sent.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The body is not a valid chat request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// The request carries no message at all.
    #[error("malformed request: `messages` must not be empty")]
    EmptyConversation,
    /// The backend refused or could not take the request.
    #[error("model backend error: {0}")]
    Backend(#[from] BackendError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::MalformedRequest(rejection.body_text())
    }
}

impl ApiError {
    /// Returns the status code this error is answered with.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MalformedRequest(_) | ApiError::EmptyConversation => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Backend(err) => match err.kind() {
                ErrorKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
                ErrorKind::Moderated => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::Unauthorized
                | ErrorKind::Unavailable
                | ErrorKind::Other => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("chat request failed: {self}");
        } else {
            warn!("chat request rejected: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(kind: ErrorKind) -> ApiError {
        ApiError::Backend(BackendError {
            message: "nope".to_owned(),
            kind,
        })
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::EmptyConversation.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            backend(ErrorKind::RateLimitExceeded).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            backend(ErrorKind::Moderated).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            backend(ErrorKind::Unauthorized).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::auth::AuthError;
use crate::codec::DecodeError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Please sign in to generate 3D image links")]
    AuthRequired,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    InvalidInput(String),

    #[error("An upload is already in progress")]
    UploadInProgress,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid URL-{0}")]
    Decode(#[from] DecodeError),

    #[error("Not found")]
    NotFound,

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => AppError::InvalidCredentials,
        }
    }
}

impl AppError {
    /// Whether re-issuing the same request may succeed without the user changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Decode(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let retryable = self.is_retryable();
        let message = self.to_string();
        let (status, error_message) = match self {
            AppError::AuthRequired => (StatusCode::UNAUTHORIZED, message),
            AppError::InvalidCredentials => (StatusCode::UNAUTHORIZED, message),
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::UploadInProgress => (StatusCode::CONFLICT, message),
            AppError::Storage(StorageError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "Not found".to_string())
            }
            AppError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            AppError::Decode(_) => (StatusCode::BAD_REQUEST, message),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "retryable": retryable,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_errors_are_retryable_and_carry_the_reason() {
        let err = AppError::from(DecodeError::BadPadding);
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Invalid URL-token was not produced with this key or has been corrupted"
        );
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn statuses_follow_the_error_kind() {
        let cases = [
            (AppError::AuthRequired, StatusCode::UNAUTHORIZED),
            (AppError::InvalidInput("Please upload an image file".into()), StatusCode::BAD_REQUEST),
            (AppError::UploadInProgress, StatusCode::CONFLICT),
            (AppError::NotFound, StatusCode::NOT_FOUND),
            (
                AppError::Storage(StorageError::Io(std::io::Error::other("disk full"))),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                AppError::Storage(StorageError::NotFound("x".into())),
                StatusCode::NOT_FOUND,
            ),
        ];

        for (err, status) in cases {
            assert!(!err.is_retryable());
            assert_eq!(err.into_response().status(), status);
        }
    }
}

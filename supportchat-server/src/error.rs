//! Error taxonomy for the chat core.
//!
//! Transport and validation failures are normally recovered inside the
//! connection that hit them; the remaining variants surface through the
//! REST API via [`IntoResponse`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// No session cookie, or one the store doesn't know.
    #[error("not authenticated")]
    Unauthenticated,
    /// Caller is authenticated but may not act on this chat.
    #[error("forbidden")]
    Forbidden,
    #[error("chat {0} not found")]
    NotFound(i64),
    /// Message references a chat id that has no row.
    #[error("chat {0} does not exist")]
    ConstraintViolation(i64),
    #[error("chat {0} is closed")]
    ChatClosed(i64),
    #[error("invalid message: {0}")]
    Validation(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::ConstraintViolation(_) | ChatError::ChatClosed(_) => StatusCode::CONFLICT,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Transport(_) | ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {self}");
        }
        // Storage details stay in the log.
        let message = match &self {
            ChatError::Storage(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ChatError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ChatError::NotFound(3).status(), StatusCode::NOT_FOUND);
        assert_eq!(ChatError::ConstraintViolation(3).status(), StatusCode::CONFLICT);
        assert_eq!(ChatError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ChatError::Validation("empty").status(), StatusCode::BAD_REQUEST);
    }
}

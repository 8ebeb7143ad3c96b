use axum::{response::IntoResponse, Json};

/// Domain error for the chat core.
///
/// `CannotProceed` is the typed guard failure: the entity exists but is not in
/// a state that allows the requested transition (assigning a non-queued
/// session, transferring to a full agent). Callers with a fallback — leave the
/// session queued — match on it instead of treating it as exceptional.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Cannot proceed: {0}")]
    CannotProceed(String),
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
}

impl IntoResponse for ChatError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let (status, message) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::CannotProceed(msg) => (StatusCode::CONFLICT, msg.clone()),
            Self::Database(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            Self::Pool(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn status_codes_distinguish_guard_failures_from_not_found() {
        let resp = ChatError::NotFound("session 9".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ChatError::CannotProceed("session 9 is not queued".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = ChatError::Validation("rating must be between 1 and 5".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type Result<T, E = EngagementError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum EngagementError {
    #[error("quiz already attempted")]
    AlreadyAttempted,
    #[error("session is not active")]
    NotActive,
    #[error("session deadline has passed")]
    Expired,
    #[error("row changed since it was read")]
    GuardConflict,
    #[error("unknown quiz: {0}")]
    UnknownQuiz(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EngagementError {
    pub fn code(&self) -> &'static str {
        match self {
            EngagementError::AlreadyAttempted => "already_attempted",
            EngagementError::NotActive => "not_active",
            EngagementError::Expired => "expired",
            EngagementError::GuardConflict => "guard_conflict",
            EngagementError::UnknownQuiz(_) => "unknown_quiz",
            EngagementError::SessionNotFound(_) => "session_not_found",
            EngagementError::InvalidInput(_) => "invalid_input",
            EngagementError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EngagementError::AlreadyAttempted
            | EngagementError::NotActive
            | EngagementError::GuardConflict => StatusCode::CONFLICT,
            EngagementError::Expired => StatusCode::GONE,
            EngagementError::UnknownQuiz(_) | EngagementError::SessionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngagementError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngagementError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Business errors are answered to the caller; everything else is infrastructure.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            EngagementError::AlreadyAttempted
                | EngagementError::NotActive
                | EngagementError::Expired
                | EngagementError::UnknownQuiz(_)
                | EngagementError::SessionNotFound(_)
                | EngagementError::InvalidInput(_)
        )
    }
}

impl From<mongodb::error::Error> for EngagementError {
    fn from(err: mongodb::error::Error) -> Self {
        EngagementError::StoreUnavailable(err.to_string())
    }
}

impl From<mongodb::bson::ser::Error> for EngagementError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        EngagementError::StoreUnavailable(format!("bson encoding failed: {}", err))
    }
}

impl From<redis::RedisError> for EngagementError {
    fn from(err: redis::RedisError) -> Self {
        EngagementError::StoreUnavailable(err.to_string())
    }
}

impl IntoResponse for EngagementError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_business() {
            tracing::debug!(error = %self, "request rejected");
        } else {
            tracing::error!(error = %self, "request failed");
        }

        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
            "status": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

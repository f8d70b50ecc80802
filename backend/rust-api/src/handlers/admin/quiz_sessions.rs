use axum::{
    extract::{Extension, Path, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::{
    error::Result, middlewares::auth::JwtClaims, models::QuizSessionView, services::AppState,
};

/// Any user's attempt, for review.
pub async fn get_quiz_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse> {
    let session = state.quizzes.get(&session_id).await?;
    Ok(Json(QuizSessionView::at(session, state.clock.now())))
}

/// Invalidates a running attempt.
pub async fn abandon_quiz_session(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse> {
    let now = state.clock.now();
    let session = state.quizzes.abandon(&session_id, now).await?;
    tracing::info!(
        admin_id = %claims.sub,
        session_id = %session.id,
        user_id = %session.user_id,
        "quiz session abandoned by admin"
    );
    Ok(Json(QuizSessionView::at(session, now)))
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

use crate::{
    error::Result,
    extractors::AppJson,
    middlewares::auth::JwtClaims,
    models::{QuizSessionView, RecordSignalRequest},
    services::AppState,
};

pub async fn start_quiz_session(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(quiz_id): Path<String>,
) -> Result<impl IntoResponse> {
    let now = state.clock.now();
    let session = state.quizzes.start(&claims.sub, &quiz_id, now).await?;
    Ok((StatusCode::CREATED, Json(QuizSessionView::at(session, now))))
}

/// Resume view. Finished attempts come back in their terminal state.
pub async fn get_quiz_session(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse> {
    let session = state.quizzes.get_owned(&claims.sub, &session_id).await?;
    Ok(Json(QuizSessionView::at(session, state.clock.now())))
}

pub async fn record_signal(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
    AppJson(req): AppJson<RecordSignalRequest>,
) -> Result<StatusCode> {
    state.quizzes.get_owned(&claims.sub, &session_id).await?;
    state
        .quizzes
        .record_signal(&session_id, req.kind, state.clock.now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn submit_quiz_session(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse> {
    state.quizzes.get_owned(&claims.sub, &session_id).await?;
    let now = state.clock.now();
    let session = state.quizzes.submit(&session_id, now).await?;
    Ok(Json(QuizSessionView::at(session, now)))
}

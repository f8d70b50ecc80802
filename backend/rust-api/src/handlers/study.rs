use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::sync::Arc;

use crate::{
    error::Result,
    extractors::{AppJson, ValidJson},
    middlewares::auth::JwtClaims,
    models::{
        DailyStudyTimeQuery, DailyStudyTimeView, RecordActionRequest, StudyKey, StudyVisitRequest,
        TotalStudyTimeResponse,
    },
    services::AppState,
};

fn key_for(claims: &JwtClaims, req: StudyVisitRequest) -> StudyKey {
    StudyKey::new(claims.sub.clone(), req.resource_type, req.resource_id)
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    ValidJson(req): ValidJson<StudyVisitRequest>,
) -> Result<impl IntoResponse> {
    let now = state.clock.now();
    let key = key_for(&claims, req);
    let session = state.tracker.start(&key, now).await?;
    state.note_activity(&claims.sub, now).await?;
    Ok(Json(session))
}

pub async fn touch_session(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    ValidJson(req): ValidJson<StudyVisitRequest>,
) -> Result<impl IntoResponse> {
    let now = state.clock.now();
    let key = key_for(&claims, req);
    let session = state.tracker.touch(&key, now).await?;
    state.note_activity(&claims.sub, now).await?;
    Ok(Json(session))
}

/// 200 with the closed session, or 204 when nothing was open for the resource.
pub async fn leave_session(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    ValidJson(req): ValidJson<StudyVisitRequest>,
) -> Result<Response> {
    let key = key_for(&claims, req);
    match state.tracker.close_active(&key, state.clock.now()).await? {
        Some(session) => Ok(Json(session).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub async fn record_action(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    AppJson(req): AppJson<RecordActionRequest>,
) -> Result<StatusCode> {
    let now = state.clock.now();
    state
        .tracker
        .record_action(&claims.sub, req.category, now)
        .await?;
    state.note_activity(&claims.sub, now).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn total_study_time(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> Result<impl IntoResponse> {
    let total_seconds = state.tracker.total_study_seconds(&claims.sub).await?;
    Ok(Json(TotalStudyTimeResponse {
        user_id: claims.sub,
        total_seconds,
    }))
}

pub async fn daily_study_time(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Query(query): Query<DailyStudyTimeQuery>,
) -> Result<impl IntoResponse> {
    let date = query
        .date
        .unwrap_or_else(|| state.tracker.today(state.clock.now()));
    let row = state.tracker.daily(&claims.sub, date).await?;
    Ok(Json(DailyStudyTimeView::of(&claims.sub, date, row)))
}

use axum::{extract::State, response::IntoResponse, Extension, Json};
use std::sync::Arc;

use crate::{
    error::Result, middlewares::auth::JwtClaims, models::StreakView, services::AppState,
};

pub async fn get_streak(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> Result<impl IntoResponse> {
    let streak = state.streaks.get(&claims.sub).await?;
    Ok(Json(StreakView::of(&claims.sub, streak)))
}

pub async fn record_activity(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> Result<impl IntoResponse> {
    let streak = state
        .streaks
        .record_activity(&claims.sub, state.clock.now())
        .await?;
    Ok(Json(StreakView::of(&claims.sub, Some(streak))))
}

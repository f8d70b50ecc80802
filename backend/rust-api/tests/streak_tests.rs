use axum::http::StatusCode;
use chrono::Duration;

mod common;

use common::{create_test_app, token_for};
use engagement_api::models::EngagementEvent;

#[tokio::test]
async fn test_streak_without_activity_is_zero() {
    let app = create_test_app();
    let token = token_for("student-1", "student");

    let (status, streak) = app.send("GET", "/api/v1/streak", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(streak["current_streak"], 0);
    assert_eq!(streak["longest_streak"], 0);
    assert!(streak["last_activity_at"].is_null());
}

#[tokio::test]
async fn test_consecutive_days_extend_then_gap_resets() {
    let app = create_test_app();
    let token = token_for("student-1", "student");

    let (_, day1) = app
        .send("POST", "/api/v1/streak/activity", Some(&token), None)
        .await;
    assert_eq!(day1["current_streak"], 1);

    app.clock.advance(Duration::hours(3));
    let (_, same_day) = app
        .send("POST", "/api/v1/streak/activity", Some(&token), None)
        .await;
    assert_eq!(same_day["current_streak"], 1);

    app.clock.advance(Duration::days(1));
    let (_, day2) = app
        .send("POST", "/api/v1/streak/activity", Some(&token), None)
        .await;
    assert_eq!(day2["current_streak"], 2);
    assert_eq!(day2["longest_streak"], 2);

    app.clock.advance(Duration::days(2));
    let (status, day4) = app
        .send("POST", "/api/v1/streak/activity", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(day4["current_streak"], 1);
    assert_eq!(day4["longest_streak"], 2);

    // Milestones are configured at 2 for these tests.
    let milestones = app
        .notifier
        .events()
        .into_iter()
        .filter(|e| matches!(e, EngagementEvent::StreakMilestone { streak: 2, .. }))
        .count();
    assert_eq!(milestones, 1);
}

#[tokio::test]
async fn test_expire_sweep_resets_stale_streaks() {
    let app = create_test_app();
    let stale = token_for("student-1", "student");
    let fresh = token_for("student-2", "student");

    app.send("POST", "/api/v1/streak/activity", Some(&stale), None)
        .await;
    app.clock.advance(Duration::days(1));
    app.send("POST", "/api/v1/streak/activity", Some(&stale), None)
        .await;

    app.clock.advance(Duration::hours(30));
    app.send("POST", "/api/v1/streak/activity", Some(&fresh), None)
        .await;

    app.state.jobs().expire_streaks().await.unwrap();

    let (_, stale_view) = app.send("GET", "/api/v1/streak", Some(&stale), None).await;
    assert_eq!(stale_view["current_streak"], 0);
    assert_eq!(stale_view["longest_streak"], 2);

    let (_, fresh_view) = app.send("GET", "/api/v1/streak", Some(&fresh), None).await;
    assert_eq!(fresh_view["current_streak"], 1);
}

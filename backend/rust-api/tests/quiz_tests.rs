use axum::http::StatusCode;
use chrono::Duration;
use serde_json::{json, Value};

mod common;

use common::{create_test_app, token_for, TestApp};
use engagement_api::models::EngagementEvent;

async fn start(app: &TestApp, token: &str, quiz_id: &str) -> Value {
    let (status, body) = app
        .send("POST", &format!("/api/v1/quizzes/{}/sessions", quiz_id), Some(token), None)
        .await;
    assert_eq!(status, StatusCode::CREATED, "start failed: {}", body);
    body
}

#[tokio::test]
async fn test_start_returns_deadline() {
    let app = create_test_app();
    let token = token_for("student-1", "student");

    let session = start(&app, &token, "cardio-mock").await;
    assert_eq!(session["status"], "active");
    assert_eq!(session["remaining_seconds"], 1800);
    assert_eq!(session["lockdown"], true);
    assert_eq!(session["tab_switches"], 0);
}

#[tokio::test]
async fn test_second_attempt_rejected() {
    let app = create_test_app();
    let token = token_for("student-1", "student");
    start(&app, &token, "cardio-mock").await;

    let (status, body) = app
        .send("POST", "/api/v1/quizzes/cardio-mock/sessions", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_attempted");

    // Another student is unaffected.
    let other = token_for("student-2", "student");
    start(&app, &other, "cardio-mock").await;
}

#[tokio::test]
async fn test_unknown_quiz() {
    let app = create_test_app();
    let token = token_for("student-1", "student");

    let (status, body) = app
        .send("POST", "/api/v1/quizzes/missing/sessions", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_quiz");
}

#[tokio::test]
async fn test_signals_then_submit_once() {
    let app = create_test_app();
    let token = token_for("student-1", "student");
    let session = start(&app, &token, "cardio-mock").await;
    let id = session["id"].as_str().unwrap().to_string();

    app.clock.advance(Duration::seconds(60));
    for kind in ["tab_switch", "tab_switch", "focus_loss"] {
        let (status, _) = app
            .send(
                "POST",
                &format!("/api/v1/quiz-sessions/{}/signals", id),
                Some(&token),
                Some(json!({ "kind": kind })),
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    let (status, resumed) = app
        .send("GET", &format!("/api/v1/quiz-sessions/{}", id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["tab_switches"], 2);
    assert_eq!(resumed["focus_losses"], 1);
    assert_eq!(resumed["remaining_seconds"], 1740);

    let (status, submitted) = app
        .send("POST", &format!("/api/v1/quiz-sessions/{}/submit", id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(submitted["status"], "submitted");
    assert_eq!(submitted["auto_submitted"], false);
    assert_eq!(submitted["remaining_seconds"], 0);

    let (status, body) = app
        .send("POST", &format!("/api/v1/quiz-sessions/{}/submit", id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_active");

    let (status, _) = app
        .send(
            "POST",
            &format!("/api/v1/quiz-sessions/{}/signals", id),
            Some(&token),
            Some(json!({ "kind": "tab_switch" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_submit_after_deadline_is_expired() {
    let app = create_test_app();
    let token = token_for("student-1", "student");
    let session = start(&app, &token, "neuro-drill").await;
    let id = session["id"].as_str().unwrap().to_string();

    app.clock.advance(Duration::seconds(61));
    let (status, body) = app
        .send("POST", &format!("/api/v1/quiz-sessions/{}/submit", id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"], "expired");
}

#[tokio::test]
async fn test_sweep_auto_submits_at_deadline() {
    let app = create_test_app();
    let token = token_for("student-1", "student");
    let session = start(&app, &token, "neuro-drill").await;
    let id = session["id"].as_str().unwrap().to_string();
    let expires_at = session["expires_at"].clone();

    app.clock.advance(Duration::minutes(5));
    app.state.jobs().expire_quiz_sessions().await.unwrap();

    let (status, finished) = app
        .send("GET", &format!("/api/v1/quiz-sessions/{}", id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(finished["status"], "submitted");
    assert_eq!(finished["auto_submitted"], true);
    assert_eq!(finished["ended_at"], expires_at);
    assert_eq!(finished["remaining_seconds"], 0);

    let (status, body) = app
        .send("POST", &format!("/api/v1/quiz-sessions/{}/submit", id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_active");

    let auto = app
        .notifier
        .events()
        .into_iter()
        .filter(|e| matches!(e, EngagementEvent::QuizAutoSubmitted { .. }))
        .count();
    assert_eq!(auto, 1);
}

#[tokio::test]
async fn test_foreign_session_is_hidden() {
    let app = create_test_app();
    let owner = token_for("student-1", "student");
    let session = start(&app, &owner, "cardio-mock").await;
    let id = session["id"].as_str().unwrap().to_string();

    let intruder = token_for("student-2", "student");
    let (status, body) = app
        .send("GET", &format!("/api/v1/quiz-sessions/{}", id), Some(&intruder), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "session_not_found");

    let (status, _) = app
        .send("POST", &format!("/api/v1/quiz-sessions/{}/submit", id), Some(&intruder), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_abandon() {
    let app = create_test_app();
    let student = token_for("student-1", "student");
    let session = start(&app, &student, "cardio-mock").await;
    let id = session["id"].as_str().unwrap().to_string();

    let (status, _) = app
        .send("POST", &format!("/admin/quiz-sessions/{}/abandon", id), Some(&student), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = token_for("admin-1", "admin");
    let (status, abandoned) = app
        .send("POST", &format!("/admin/quiz-sessions/{}/abandon", id), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(abandoned["status"], "abandoned");

    let (status, viewed) = app
        .send("GET", &format!("/admin/quiz-sessions/{}", id), Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(viewed["user_id"], "student-1");

    let (status, body) = app
        .send("POST", &format!("/api/v1/quiz-sessions/{}/submit", id), Some(&student), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_active");
}

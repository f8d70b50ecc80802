use axum::http::StatusCode;

mod common;

use common::{basic_auth, create_test_app};

#[tokio::test]
async fn test_health_reports_dependencies() {
    let app = create_test_app();

    let (status, body) = app.send("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["dependencies"]["store"]["status"], "healthy");
    assert_eq!(body["dependencies"]["cache"]["status"], "healthy");
}

#[tokio::test]
async fn test_health_unavailable_without_store() {
    let app = create_test_app();
    app.store.set_unavailable(true);

    let (status, body) = app.send("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_store_outage_maps_to_503() {
    let app = create_test_app();
    let token = common::token_for("student-1", "student");
    app.store.set_unavailable(true);

    let (status, body) = app
        .send("GET", "/api/v1/streak", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "store_unavailable");
}

#[tokio::test]
async fn test_metrics_requires_basic_auth() {
    let app = create_test_app();
    app.send("GET", "/health", None, None).await;

    let (status, _) = app.send("GET", "/metrics", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let response = {
        use axum::body::{to_bytes, Body};
        use axum::http::Request;
        use tower::ServiceExt;

        let request = Request::builder()
            .uri("/metrics")
            .header("authorization", basic_auth("admin:changeme"))
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    };
    assert_eq!(response.0, StatusCode::OK);
    assert!(response.1.contains("http_requests_total"));
}

#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

use engagement_api::{
    clock::ManualClock,
    config::{Config, EngagementConfig, SchedulerConfig},
    create_router,
    middlewares::auth::{JwtClaims, JwtService},
    services::{
        notifier::RecordingNotifier, quiz_catalog::StaticQuizCatalog,
        study_time_cache::MemoryStudyTimeCache, AppState, Collaborators,
    },
    store::MemoryEngagementStore,
};

pub const JWT_SECRET: &str = "test-secret";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 20, 8, 0, 0).unwrap()
}

pub fn test_config() -> Config {
    Config {
        mongo_uri: "mongodb://localhost:27017".to_string(),
        redis_uri: "redis://127.0.0.1:6379/0".to_string(),
        mongo_database: "engagement_test".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        port: 0,
        engagement: EngagementConfig {
            streak_milestones: vec![2],
            ..EngagementConfig::default()
        },
        scheduler: SchedulerConfig::default(),
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryEngagementStore>,
    pub notifier: Arc<RecordingNotifier>,
}

/// Router over in-memory collaborators and a manual clock starting at `start_time()`.
pub fn create_test_app() -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let clock = Arc::new(ManualClock::new(start_time()));
    let store = Arc::new(MemoryEngagementStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let catalog = StaticQuizCatalog::new()
        .with_quiz("cardio-mock", 30, true)
        .with_quiz("neuro-drill", 1, false);

    let state = Arc::new(AppState::from_parts(
        test_config(),
        Collaborators {
            store: store.clone(),
            catalog: Arc::new(catalog),
            cache: Arc::new(MemoryStudyTimeCache::new()),
            notifier: notifier.clone(),
            clock: clock.clone(),
        },
    ));

    TestApp {
        router: create_router(state.clone()),
        state,
        clock,
        store,
        notifier,
    }
}

pub fn token_for(user_id: &str, role: &str) -> String {
    JwtService::new(JWT_SECRET)
        .generate_token(&JwtClaims::new(user_id, role, 3600))
        .unwrap()
}

pub fn basic_auth(credentials: &str) -> String {
    format!("Basic {}", general_purpose::STANDARD.encode(credentials))
}

impl TestApp {
    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, json)
    }
}

use axum::{
    http::{header, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

pub mod clock;
pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod store;
pub mod telemetry;
pub mod utils;

pub use config::Config;
pub use error::EngagementError;
pub use services::AppState;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        // Public
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        // Require JWT
        .nest(
            "/api/v1",
            api_routes()
                .layer(cors)
                .layer(middleware::from_fn_with_state(
                    app_state.clone(),
                    middlewares::auth::auth_middleware,
                )),
        )
        .nest(
            "/admin",
            admin_routes()
                .layer(middleware::from_fn(
                    middlewares::auth::admin_guard_middleware,
                ))
                .layer(middleware::from_fn_with_state(
                    app_state.clone(),
                    middlewares::auth::auth_middleware,
                )),
        )
        .with_state(app_state)
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Study time
        .route("/study/sessions/start", post(handlers::study::start_session))
        .route("/study/sessions/touch", post(handlers::study::touch_session))
        .route("/study/sessions/leave", post(handlers::study::leave_session))
        .route("/study/actions", post(handlers::study::record_action))
        .route("/study/time/total", get(handlers::study::total_study_time))
        .route("/study/time/daily", get(handlers::study::daily_study_time))
        // Streaks
        .route("/streak", get(handlers::streak::get_streak))
        .route("/streak/activity", post(handlers::streak::record_activity))
        // Quizzes
        .route(
            "/quizzes/{quiz_id}/sessions",
            post(handlers::quiz::start_quiz_session),
        )
        .route("/quiz-sessions/{id}", get(handlers::quiz::get_quiz_session))
        .route(
            "/quiz-sessions/{id}/signals",
            post(handlers::quiz::record_signal),
        )
        .route(
            "/quiz-sessions/{id}/submit",
            post(handlers::quiz::submit_quiz_session),
        )
}

fn admin_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/quiz-sessions/{id}",
            get(handlers::admin::get_quiz_session),
        )
        .route(
            "/quiz-sessions/{id}/abandon",
            post(handlers::admin::abandon_quiz_session),
        )
}

/// Resolves on ctrl-c, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

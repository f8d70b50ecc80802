use anyhow::Context;
use std::sync::Arc;

use engagement_api::{
    config::Config, create_router, services::engagement_jobs::build_scheduler,
    services::AppState, shutdown_signal, telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let telemetry = telemetry::init_tracing("engagement-api");

    tracing::info!("Starting engagement API");

    let config = Config::load().context("Failed to load configuration")?;
    tracing::info!(
        "Configuration loaded for environment: {:?}",
        std::env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string())
    );
    let port = config.port;
    let scheduler_config = config.scheduler.clone();

    let mongo_client = mongodb::Client::with_uri_str(&config.mongo_uri)
        .await
        .context("Failed to connect to MongoDB")?;
    tracing::info!("MongoDB connected");

    let redis_client =
        redis::Client::open(config.redis_uri.clone()).context("Failed to create Redis client")?;

    let app_state = Arc::new(
        AppState::new(config, mongo_client, redis_client)
            .await
            .context("Failed to initialize application state")?,
    );

    // Sweeps run in-process unless a dedicated engagement-scheduler owns them.
    let mut scheduler = if scheduler_config.enabled {
        let mut scheduler = build_scheduler(app_state.jobs(), &scheduler_config)?;
        scheduler.start_all()?;
        Some(scheduler)
    } else {
        tracing::info!("In-process scheduler disabled");
        None
    };

    let app = create_router(app_state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.stop_all().await;
    }
    telemetry.shutdown();
    Ok(())
}

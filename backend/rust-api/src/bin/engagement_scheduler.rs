//! Scheduler-only process. Run exactly one of these (with `scheduler.enabled = false`
//! on the API replicas) when the API is scaled past a single instance.

use anyhow::Context;

use engagement_api::{
    config::Config, services::engagement_jobs::build_scheduler, services::AppState,
    shutdown_signal, telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let telemetry = telemetry::init_tracing("engagement-scheduler");

    let config = Config::load().context("Failed to load configuration")?;
    let scheduler_config = config.scheduler.clone();

    let mongo_client = mongodb::Client::with_uri_str(&config.mongo_uri)
        .await
        .context("Failed to connect to MongoDB")?;
    let redis_client =
        redis::Client::open(config.redis_uri.clone()).context("Failed to create Redis client")?;

    let app_state = AppState::new(config, mongo_client, redis_client)
        .await
        .context("Failed to initialize application state")?;

    let mut scheduler = build_scheduler(app_state.jobs(), &scheduler_config)?;
    scheduler.run_until(shutdown_signal()).await?;

    telemetry.shutdown();
    Ok(())
}

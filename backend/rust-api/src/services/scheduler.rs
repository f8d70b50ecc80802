use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use cron::Schedule;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::metrics::{SCHEDULER_JOB_DURATION_SECONDS, SCHEDULER_JOB_RUNS_TOTAL};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

type Runnable = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression for job {job}: {source}")]
    InvalidCron {
        job: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("job already registered: {0}")]
    DuplicateJob(String),
    #[error("scheduler already started")]
    AlreadyStarted,
}

struct RegisteredJob {
    name: String,
    schedule: Schedule,
    runnable: Runnable,
}

/// In-process cron runner. Each job gets its own task and timer; a failing or
/// panicking run is logged and the job keeps its next tick. A run is awaited
/// before the next fire time is computed, so a job never overlaps itself.
pub struct PeriodicScheduler {
    jobs: Vec<RegisteredJob>,
    retry: RetryConfig,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl PeriodicScheduler {
    pub fn new(retry: RetryConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            retry,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Registers a job under a six-field (seconds-first) cron expression.
    pub fn register<F, Fut>(
        &mut self,
        name: &str,
        cron_expression: &str,
        runnable: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !self.handles.is_empty() {
            return Err(SchedulerError::AlreadyStarted);
        }
        if self.jobs.iter().any(|j| j.name == name) {
            return Err(SchedulerError::DuplicateJob(name.to_string()));
        }
        let schedule =
            Schedule::from_str(cron_expression).map_err(|source| SchedulerError::InvalidCron {
                job: name.to_string(),
                source,
            })?;

        self.jobs.push(RegisteredJob {
            name: name.to_string(),
            schedule,
            runnable: Arc::new(move || runnable().boxed()),
        });
        tracing::info!(job = name, schedule = cron_expression, "job registered");
        Ok(())
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn start_all(&mut self) -> Result<(), SchedulerError> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyStarted);
        }
        self.shutdown_tx.send_replace(false);

        for job in &self.jobs {
            let name = job.name.clone();
            let schedule = job.schedule.clone();
            let runnable = job.runnable.clone();
            let retry = self.retry.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            self.handles.push(tokio::spawn(async move {
                loop {
                    let Some(next) = schedule.upcoming(Utc).next() else {
                        tracing::warn!(job = %name, "schedule has no upcoming fire time, stopping job");
                        break;
                    };
                    let wait = (next - Utc::now()).to_std().unwrap_or_default();

                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                            continue;
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }

                    run_once(&name, &runnable, &retry).await;
                }
                tracing::debug!(job = %name, "job loop stopped");
            }));
        }

        tracing::info!(jobs = self.jobs.len(), "scheduler started");
        Ok(())
    }

    /// Starts every job, waits for `shutdown`, then stops and drains in-flight runs.
    pub async fn run_until<S>(&mut self, shutdown: S) -> Result<(), SchedulerError>
    where
        S: Future<Output = ()>,
    {
        self.start_all()?;
        tracing::info!(jobs = ?self.job_names(), "engagement scheduler running");
        shutdown.await;
        self.stop_all().await;
        Ok(())
    }

    /// Cancels every timer and waits for in-flight runs to finish.
    pub async fn stop_all(&mut self) {
        if !self.is_running() {
            return;
        }
        tracing::info!("stopping scheduler");
        self.shutdown_tx.send_replace(true);

        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "job loop terminated abnormally");
            }
        }
        tracing::info!("scheduler stopped");
    }
}

/// One invocation with retries. Each attempt runs in its own task so a panic
/// surfaces as an error here instead of unwinding the job loop.
async fn run_once(name: &str, runnable: &Runnable, retry: &RetryConfig) -> bool {
    let start = Instant::now();
    let result = retry_async_with_config(name, retry, || {
        let attempt = tokio::spawn(runnable());
        async move {
            match attempt.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(anyhow::anyhow!("job task failed: {}", join_err)),
            }
        }
    })
    .await;

    SCHEDULER_JOB_DURATION_SECONDS
        .with_label_values(&[name])
        .observe(start.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            SCHEDULER_JOB_RUNS_TOTAL
                .with_label_values(&[name, "success"])
                .inc();
            true
        }
        Err(e) => {
            SCHEDULER_JOB_RUNS_TOTAL
                .with_label_values(&[name, "error"])
                .inc();
            tracing::error!(job = name, error = %e, "job run failed, waiting for next tick");
            false
        }
    }
}

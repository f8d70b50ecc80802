use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::services::quiz_session_engine::QuizSessionEngine;
use crate::services::scheduler::{PeriodicScheduler, SchedulerError};
use crate::services::streak_engine::StreakEngine;
use crate::services::study_session_tracker::StudySessionTracker;
use crate::utils::retry::RetryConfig;

pub const IDLE_CLOSE_JOB: &str = "study-sessions-idle-close";
pub const QUIZ_EXPIRE_JOB: &str = "quiz-sessions-expire";
pub const STREAK_EXPIRE_JOB: &str = "streaks-expire";

/// Everything the sweeps need, shared with the request side.
#[derive(Clone)]
pub struct EngagementJobs {
    pub tracker: Arc<StudySessionTracker>,
    pub quizzes: Arc<QuizSessionEngine>,
    pub streaks: Arc<StreakEngine>,
    pub clock: Arc<dyn Clock>,
    pub idle_threshold_seconds: i64,
}

impl EngagementJobs {
    pub async fn close_idle_study_sessions(&self) -> anyhow::Result<()> {
        let now = self.clock.now();
        let closed = self
            .tracker
            .close_idle(self.idle_threshold_seconds, now)
            .await?;
        if closed > 0 {
            tracing::info!(job = IDLE_CLOSE_JOB, closed, "idle study sessions closed");
        } else {
            tracing::debug!(job = IDLE_CLOSE_JOB, "no idle study sessions");
        }
        Ok(())
    }

    pub async fn expire_quiz_sessions(&self) -> anyhow::Result<()> {
        let now = self.clock.now();
        let expired = self.quizzes.expire_due(now).await?;
        if expired > 0 {
            tracing::info!(job = QUIZ_EXPIRE_JOB, expired, "quiz sessions auto-submitted");
        } else {
            tracing::debug!(job = QUIZ_EXPIRE_JOB, "no quiz sessions due");
        }
        Ok(())
    }

    pub async fn expire_streaks(&self) -> anyhow::Result<()> {
        let now = self.clock.now();
        let reset = self.streaks.expire_stale(now).await?;
        tracing::info!(job = STREAK_EXPIRE_JOB, reset, "stale streaks reset");
        Ok(())
    }
}

/// Builds the scheduler with the three engagement sweeps registered.
pub fn build_scheduler(
    jobs: EngagementJobs,
    config: &SchedulerConfig,
) -> Result<PeriodicScheduler, SchedulerError> {
    let retry = RetryConfig::new(
        config.retry_attempts,
        Duration::from_millis(config.retry_backoff_ms),
    );
    let mut scheduler = PeriodicScheduler::new(retry);

    let idle = jobs.clone();
    scheduler.register(IDLE_CLOSE_JOB, &config.idle_close_cron, move || {
        let jobs = idle.clone();
        async move { jobs.close_idle_study_sessions().await }
    })?;

    let quiz = jobs.clone();
    scheduler.register(QUIZ_EXPIRE_JOB, &config.quiz_expire_cron, move || {
        let jobs = quiz.clone();
        async move { jobs.expire_quiz_sessions().await }
    })?;

    let streak = jobs;
    scheduler.register(STREAK_EXPIRE_JOB, &config.streak_expire_cron, move || {
        let jobs = streak.clone();
        async move { jobs.expire_streaks().await }
    })?;

    Ok(scheduler)
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mongodb::Client as MongoClient;
use redis::aio::ConnectionManager;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{EngagementError, Result};
use crate::store::{EngagementStore, MongoEngagementStore};
use crate::utils::time::Calendar;

use self::engagement_jobs::EngagementJobs;
use self::notifier::{Notifier, RedisNotifier};
use self::quiz_catalog::{MongoQuizCatalog, QuizCatalog};
use self::quiz_session_engine::QuizSessionEngine;
use self::streak_engine::StreakEngine;
use self::study_session_tracker::StudySessionTracker;
use self::study_time_cache::{RedisStudyTimeCache, StudyTimeCache};

pub mod engagement_jobs;
pub mod notifier;
pub mod quiz_catalog;
pub mod quiz_session_engine;
pub mod scheduler;
pub mod streak_engine;
pub mod study_session_tracker;
pub mod study_time_cache;

/// Collaborators the engines are built from. Production wires MongoDB and
/// Redis; tests swap in the in-memory variants.
pub struct Collaborators {
    pub store: Arc<dyn EngagementStore>,
    pub catalog: Arc<dyn QuizCatalog>,
    pub cache: Arc<dyn StudyTimeCache>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn EngagementStore>,
    pub cache: Arc<dyn StudyTimeCache>,
    pub clock: Arc<dyn Clock>,
    pub tracker: Arc<StudySessionTracker>,
    pub streaks: Arc<StreakEngine>,
    pub quizzes: Arc<QuizSessionEngine>,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let mongo = mongo_client.database(&config.mongo_database);

        tracing::info!("Attempting to connect to Redis...");

        let redis = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        tracing::info!("Redis ConnectionManager created, testing with PING...");

        let mut conn = redis.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let store = MongoEngagementStore::new(mongo.clone());
        store.ensure_indexes().await?;

        let collaborators = Collaborators {
            store: Arc::new(store),
            catalog: Arc::new(MongoQuizCatalog::new(mongo)),
            cache: Arc::new(RedisStudyTimeCache::new(
                redis.clone(),
                config.engagement.study_time_cache_ttl_seconds,
            )),
            notifier: Arc::new(RedisNotifier::new(redis)),
            clock: Arc::new(SystemClock),
        };

        Ok(Self::from_parts(config, collaborators))
    }

    pub fn from_parts(config: Config, parts: Collaborators) -> Self {
        let calendar = Calendar::from_offset_minutes(config.engagement.utc_offset_minutes);

        let tracker = StudySessionTracker::new(
            parts.store.clone(),
            parts.cache.clone(),
            parts.notifier.clone(),
            calendar,
        );
        let streaks = StreakEngine::new(
            parts.store.clone(),
            parts.notifier.clone(),
            calendar,
            config.engagement.streak_milestones.clone(),
        );
        let quizzes = QuizSessionEngine::new(
            parts.store.clone(),
            parts.catalog,
            parts.notifier,
        );

        Self {
            config,
            store: parts.store,
            cache: parts.cache,
            clock: parts.clock,
            tracker: Arc::new(tracker),
            streaks: Arc::new(streaks),
            quizzes: Arc::new(quizzes),
        }
    }

    /// Counts a study interaction toward the user's streak.
    /// A lost streak guard is logged and dropped.
    pub async fn note_activity(&self, user_id: &str, now: DateTime<Utc>) -> Result<()> {
        match self.streaks.record_activity(user_id, now).await {
            Ok(_) => Ok(()),
            Err(EngagementError::GuardConflict) => {
                tracing::warn!(user_id, "streak update kept losing guards, skipping");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Sweep jobs sharing this state's engines and clock.
    pub fn jobs(&self) -> EngagementJobs {
        EngagementJobs {
            tracker: self.tracker.clone(),
            quizzes: self.quizzes.clone(),
            streaks: self.streaks.clone(),
            clock: self.clock.clone(),
            idle_threshold_seconds: self.config.engagement.idle_threshold_seconds,
        }
    }
}

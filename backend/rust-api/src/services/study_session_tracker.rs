use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::error::{EngagementError, Result};
use crate::metrics::{record_guard_conflict, STUDY_SECONDS_ACCRUED_TOTAL, STUDY_SESSIONS_TOTAL};
use crate::models::{ActivityCategory, DailyStudyTime, EngagementEvent, StudyKey, StudySession};
use crate::services::notifier::Notifier;
use crate::services::study_time_cache::StudyTimeCache;
use crate::store::{CloseStudySession, EngagementStore};
use crate::utils::time::Calendar;

/// Bounded retries for request-path writes that lose a guard to a concurrent writer.
const MAX_GUARD_RETRIES: usize = 3;

pub struct StudySessionTracker {
    store: Arc<dyn EngagementStore>,
    cache: Arc<dyn StudyTimeCache>,
    notifier: Arc<dyn Notifier>,
    calendar: Calendar,
}

impl StudySessionTracker {
    pub fn new(
        store: Arc<dyn EngagementStore>,
        cache: Arc<dyn StudyTimeCache>,
        notifier: Arc<dyn Notifier>,
        calendar: Calendar,
    ) -> Self {
        Self {
            store,
            cache,
            notifier,
            calendar,
        }
    }

    /// Opens a visit, or touches the one already open for the key.
    pub async fn start(&self, key: &StudyKey, now: DateTime<Utc>) -> Result<StudySession> {
        self.visit(key, now).await
    }

    /// Advances `last_activity_at` to `max(stored, now)`, opening a visit if none is active.
    pub async fn touch(&self, key: &StudyKey, now: DateTime<Utc>) -> Result<StudySession> {
        self.visit(key, now).await
    }

    async fn visit(&self, key: &StudyKey, now: DateTime<Utc>) -> Result<StudySession> {
        for _ in 0..MAX_GUARD_RETRIES {
            if let Some(mut session) = self.store.find_active_study_session(key).await? {
                if self.store.advance_study_activity(&session.id, now).await? {
                    session.last_activity_at = session.last_activity_at.max(now);
                    return Ok(session);
                }
                // Closed between read and write; open a fresh one.
                record_guard_conflict("study_touch");
                continue;
            }

            let session = StudySession::open(key, now);
            if self.store.insert_study_session(&session).await? {
                STUDY_SESSIONS_TOTAL.with_label_values(&["opened"]).inc();
                if let Some(category) = key.resource_type.view_category() {
                    self.store
                        .increment_daily_counter(
                            &key.user_id,
                            self.calendar.date_of(now),
                            category,
                            now,
                        )
                        .await?;
                }
                tracing::info!(
                    user_id = %key.user_id,
                    session_id = %session.id,
                    resource_type = key.resource_type.as_str(),
                    resource_id = %key.resource_id,
                    "study session opened"
                );
                return Ok(session);
            }
            // Another request opened the same key first; touch it instead.
            record_guard_conflict("study_open");
        }

        tracing::warn!(user_id = %key.user_id, resource_id = %key.resource_id, "study visit kept losing guards");
        Err(EngagementError::GuardConflict)
    }

    /// Explicit leave. Returns the closed session, or `None` when nothing was open.
    pub async fn close_active(
        &self,
        key: &StudyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<StudySession>> {
        for _ in 0..MAX_GUARD_RETRIES {
            let Some(mut session) = self.store.find_active_study_session(key).await? else {
                return Ok(None);
            };

            // A late-arriving leave must not pull the boundary behind recorded activity.
            let end = now.max(session.last_activity_at);
            let duration_seconds = session.duration_until(end);
            let close = CloseStudySession {
                expected_last_activity: session.last_activity_at,
                end,
                duration_seconds,
            };

            if self.store.close_study_session(&session.id, close).await? {
                session.is_active = false;
                session.last_activity_at = end;
                session.duration_seconds = duration_seconds;
                STUDY_SESSIONS_TOTAL
                    .with_label_values(&["closed_explicit"])
                    .inc();
                self.fold(&mut session, false).await?;
                return Ok(Some(session));
            }
            record_guard_conflict("study_close");
        }

        Err(EngagementError::GuardConflict)
    }

    /// Closes sessions idle for longer than `idle_threshold_seconds`, ending each at its
    /// own `last_activity_at`. Sessions resumed since the scan are left alone.
    /// Closed sessions whose fold failed earlier are folded first.
    /// Returns the number closed.
    pub async fn close_idle(&self, idle_threshold_seconds: i64, now: DateTime<Utc>) -> Result<usize> {
        self.fold_pending().await?;

        let cutoff = now - Duration::seconds(idle_threshold_seconds.max(0));
        let candidates = self.store.list_idle_study_sessions(cutoff).await?;
        let mut closed = 0;

        for mut session in candidates {
            let end = session.last_activity_at;
            let duration_seconds = session.duration_until(end);
            let close = CloseStudySession {
                expected_last_activity: end,
                end,
                duration_seconds,
            };

            if !self.store.close_study_session(&session.id, close).await? {
                record_guard_conflict("study_idle_close");
                tracing::debug!(session_id = %session.id, "idle close lost guard, skipping");
                continue;
            }

            session.is_active = false;
            session.duration_seconds = duration_seconds;
            STUDY_SESSIONS_TOTAL.with_label_values(&["closed_idle"]).inc();
            self.fold(&mut session, true).await?;
            closed += 1;
        }

        Ok(closed)
    }

    /// Re-folds closed sessions left unfolded by a failed day-row write.
    async fn fold_pending(&self) -> Result<usize> {
        let pending = self.store.list_unfolded_study_sessions().await?;
        let count = pending.len();
        for mut session in pending {
            tracing::warn!(
                user_id = %session.user_id,
                session_id = %session.id,
                "folding study session left over from an earlier close"
            );
            self.fold(&mut session, false).await?;
        }
        Ok(count)
    }

    /// Folds a closed session into the day of its final activity, then marks it folded.
    /// The day-row write is idempotent per session, so a retry after a partial
    /// failure never double counts.
    async fn fold(&self, session: &mut StudySession, idle: bool) -> Result<()> {
        let date = self.calendar.date_of(session.last_activity_at);
        let counted = self
            .store
            .add_daily_study_time(
                &session.id,
                &session.user_id,
                date,
                session.duration_seconds,
                session.last_activity_at,
            )
            .await?;
        self.store.mark_study_session_folded(&session.id).await?;
        session.folded = true;
        self.cache.invalidate(&session.user_id).await;

        if !counted {
            tracing::debug!(session_id = %session.id, "study session already counted");
            return Ok(());
        }

        STUDY_SECONDS_ACCRUED_TOTAL.inc_by(session.duration_seconds.max(0) as u64);
        tracing::info!(
            user_id = %session.user_id,
            session_id = %session.id,
            duration_seconds = session.duration_seconds,
            idle,
            %date,
            "study session closed"
        );

        self.notifier.notify(EngagementEvent::StudySessionClosed {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            resource_type: session.resource_type,
            resource_id: session.resource_id.clone(),
            duration_seconds: session.duration_seconds,
            idle,
        });
        Ok(())
    }

    /// Counts a discrete action (question attempt, paper view) on today's row.
    pub async fn record_action(
        &self,
        user_id: &str,
        category: ActivityCategory,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .increment_daily_counter(user_id, self.calendar.date_of(now), category, now)
            .await
    }

    pub async fn total_study_seconds(&self, user_id: &str) -> Result<i64> {
        if let Some(total) = self.cache.get(user_id).await {
            return Ok(total);
        }
        // Read before the store so a fold landing in between voids the fill.
        let generation = self.cache.generation(user_id).await;
        let total = self.store.total_study_seconds(user_id).await?;
        if let Some(generation) = generation {
            self.cache.set(user_id, total, generation).await;
        }
        Ok(total)
    }

    pub async fn daily(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailyStudyTime>> {
        self.store.find_daily_study_time(user_id, date).await
    }

    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        self.calendar.date_of(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceType;
    use crate::services::notifier::RecordingNotifier;
    use crate::services::study_time_cache::MemoryStudyTimeCache;
    use crate::store::MemoryEngagementStore;
    use chrono::TimeZone;

    struct Harness {
        store: Arc<MemoryEngagementStore>,
        cache: Arc<MemoryStudyTimeCache>,
        notifier: Arc<RecordingNotifier>,
        tracker: StudySessionTracker,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryEngagementStore::new());
        let cache = Arc::new(MemoryStudyTimeCache::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let tracker = StudySessionTracker::new(
            store.clone(),
            cache.clone(),
            notifier.clone(),
            Calendar::utc(),
        );
        Harness {
            store,
            cache,
            notifier,
            tracker,
        }
    }

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 20, 8, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn concept(id: &str) -> StudyKey {
        StudyKey::new("u1", ResourceType::Concept, id)
    }

    #[tokio::test]
    async fn test_touch_keeps_maximum_timestamp() {
        let h = harness();
        let key = concept("5");

        h.tracker.start(&key, t(0)).await.unwrap();
        h.tracker.touch(&key, t(40)).await.unwrap();
        h.tracker.touch(&key, t(90)).await.unwrap();
        // Out-of-order arrival
        let session = h.tracker.touch(&key, t(60)).await.unwrap();

        assert_eq!(session.last_activity_at, t(90));
        let stored = h.store.study_session(&session.id).await.unwrap();
        assert_eq!(stored.last_activity_at, t(90));
        assert_eq!(h.store.study_sessions_for("u1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_counts_one_view() {
        let h = harness();
        let key = concept("5");

        let first = h.tracker.start(&key, t(0)).await.unwrap();
        let again = h.tracker.start(&key, t(5)).await.unwrap();
        assert_eq!(first.id, again.id);

        let day = h.tracker.daily("u1", t(0).date_naive()).await.unwrap().unwrap();
        assert_eq!(day.counters.concept, 1);
        assert_eq!(day.total_seconds, 0);
    }

    #[tokio::test]
    async fn test_idle_close_uses_last_activity_as_end() {
        let h = harness();
        let key = concept("5");

        h.tracker.start(&key, t(0)).await.unwrap();
        let session = h.tracker.touch(&key, t(300)).await.unwrap();

        let closed = h.tracker.close_idle(600, t(1300)).await.unwrap();
        assert_eq!(closed, 1);

        let stored = h.store.study_session(&session.id).await.unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.duration_seconds, 300);
        assert_eq!(stored.last_activity_at, t(300));

        let day = h.tracker.daily("u1", t(0).date_naive()).await.unwrap().unwrap();
        assert_eq!(day.total_seconds, 300);

        let events = h.notifier.events();
        assert!(matches!(
            events.last(),
            Some(EngagementEvent::StudySessionClosed { idle: true, duration_seconds: 300, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_day_write_is_folded_by_next_sweep() {
        let h = harness();
        let key = concept("5");
        h.tracker.start(&key, t(0)).await.unwrap();
        let session = h.tracker.touch(&key, t(300)).await.unwrap();

        h.store.fail_daily_writes(1);
        let err = h.tracker.close_idle(600, t(1300)).await.unwrap_err();
        assert!(matches!(err, EngagementError::StoreUnavailable(_)));

        let stored = h.store.study_session(&session.id).await.unwrap();
        assert!(!stored.is_active);
        assert!(!stored.folded);
        assert!(h.notifier.events().is_empty());

        // Nothing idle remains, but the closed session is folded on the way in.
        assert_eq!(h.tracker.close_idle(600, t(1400)).await.unwrap(), 0);
        let stored = h.store.study_session(&session.id).await.unwrap();
        assert!(stored.folded);
        let day = h.tracker.daily("u1", t(0).date_naive()).await.unwrap().unwrap();
        assert_eq!(day.total_seconds, 300);
        assert_eq!(h.notifier.events().len(), 1);

        // A further sweep finds nothing to fold.
        h.tracker.close_idle(600, t(1500)).await.unwrap();
        let day = h.tracker.daily("u1", t(0).date_naive()).await.unwrap().unwrap();
        assert_eq!(day.total_seconds, 300);
        assert_eq!(h.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_explicit_close_keeps_time_for_sweep() {
        let h = harness();
        let key = concept("8");
        h.tracker.start(&key, t(0)).await.unwrap();
        h.tracker.touch(&key, t(100)).await.unwrap();

        h.store.fail_daily_writes(1);
        assert!(h.tracker.close_active(&key, t(120)).await.is_err());
        // The visit is closed even though its time is not on the day row yet.
        assert!(h.tracker.close_active(&key, t(130)).await.unwrap().is_none());
        let day = h.tracker.daily("u1", t(0).date_naive()).await.unwrap().unwrap();
        assert_eq!(day.total_seconds, 0);

        h.tracker.close_idle(600, t(200)).await.unwrap();
        let day = h.tracker.daily("u1", t(0).date_naive()).await.unwrap().unwrap();
        assert_eq!(day.total_seconds, 120);
        assert_eq!(h.tracker.total_study_seconds("u1").await.unwrap(), 120);
        assert!(matches!(
            h.notifier.events().last(),
            Some(EngagementEvent::StudySessionClosed { idle: false, duration_seconds: 120, .. })
        ));
    }

    #[tokio::test]
    async fn test_close_idle_twice_is_idempotent() {
        let h = harness();
        h.tracker.start(&concept("1"), t(0)).await.unwrap();
        h.tracker.start(&concept("2"), t(10)).await.unwrap();

        assert_eq!(h.tracker.close_idle(600, t(2000)).await.unwrap(), 2);
        assert_eq!(h.tracker.close_idle(600, t(2000)).await.unwrap(), 0);

        let day = h.tracker.daily("u1", t(0).date_naive()).await.unwrap().unwrap();
        assert_eq!(day.total_seconds, 0);
    }

    #[tokio::test]
    async fn test_close_idle_skips_recently_active() {
        let h = harness();
        h.tracker.start(&concept("1"), t(0)).await.unwrap();
        h.tracker.touch(&concept("1"), t(900)).await.unwrap();

        assert_eq!(h.tracker.close_idle(600, t(1300)).await.unwrap(), 0);
        let sessions = h.store.study_sessions_for("u1").await;
        assert!(sessions[0].is_active);
    }

    #[tokio::test]
    async fn test_explicit_close_folds_and_invalidates_cache() {
        let h = harness();
        let key = concept("9");
        h.tracker.start(&key, t(0)).await.unwrap();

        assert_eq!(h.tracker.total_study_seconds("u1").await.unwrap(), 0);
        assert_eq!(h.cache.get("u1").await, Some(0));

        let closed = h.tracker.close_active(&key, t(125)).await.unwrap().unwrap();
        assert_eq!(closed.duration_seconds, 125);
        assert_eq!(h.cache.get("u1").await, None);
        assert_eq!(h.tracker.total_study_seconds("u1").await.unwrap(), 125);

        // Nothing left to close.
        assert!(h.tracker.close_active(&key, t(130)).await.unwrap().is_none());
    }

    /// Lets an invalidation land right after the generation is read.
    struct RacingCache {
        inner: MemoryStudyTimeCache,
    }

    #[async_trait::async_trait]
    impl StudyTimeCache for RacingCache {
        async fn get(&self, user_id: &str) -> Option<i64> {
            self.inner.get(user_id).await
        }

        async fn generation(&self, user_id: &str) -> Option<u64> {
            let generation = self.inner.generation(user_id).await;
            self.inner.invalidate(user_id).await;
            generation
        }

        async fn set(&self, user_id: &str, total_seconds: i64, generation: u64) -> bool {
            self.inner.set(user_id, total_seconds, generation).await
        }

        async fn invalidate(&self, user_id: &str) {
            self.inner.invalidate(user_id).await
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_total_loaded_before_invalidation_is_not_cached() {
        let store = Arc::new(MemoryEngagementStore::new());
        let cache = Arc::new(RacingCache {
            inner: MemoryStudyTimeCache::new(),
        });
        let tracker = StudySessionTracker::new(
            store.clone(),
            cache.clone(),
            Arc::new(RecordingNotifier::new()),
            Calendar::utc(),
        );
        let key = concept("4");
        tracker.start(&key, t(0)).await.unwrap();
        tracker.close_active(&key, t(90)).await.unwrap();

        assert_eq!(tracker.total_study_seconds("u1").await.unwrap(), 90);
        assert_eq!(cache.inner.get("u1").await, None);
    }

    #[tokio::test]
    async fn test_explicit_close_never_ends_before_last_activity() {
        let h = harness();
        let key = concept("9");
        h.tracker.start(&key, t(0)).await.unwrap();
        h.tracker.touch(&key, t(200)).await.unwrap();

        let closed = h.tracker.close_active(&key, t(150)).await.unwrap().unwrap();
        assert_eq!(closed.duration_seconds, 200);
        assert_eq!(closed.last_activity_at, t(200));
    }

    #[tokio::test]
    async fn test_touch_after_close_opens_new_session() {
        let h = harness();
        let key = concept("3");
        let first = h.tracker.start(&key, t(0)).await.unwrap();
        h.tracker.close_active(&key, t(60)).await.unwrap();

        let second = h.tracker.touch(&key, t(120)).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.started_at, t(120));
    }

    #[tokio::test]
    async fn test_record_action_and_today_resource() {
        let h = harness();
        h.tracker
            .record_action("u1", ActivityCategory::Mcq, t(0))
            .await
            .unwrap();
        h.tracker
            .record_action("u1", ActivityCategory::Mcq, t(1))
            .await
            .unwrap();
        h.tracker
            .start(&StudyKey::new("u1", ResourceType::Today, "dash"), t(2))
            .await
            .unwrap();

        let day = h.tracker.daily("u1", t(0).date_naive()).await.unwrap().unwrap();
        assert_eq!(day.counters.mcq, 2);
        assert_eq!(day.counters.concept, 0);
    }

    #[tokio::test]
    async fn test_store_outage_surfaces() {
        let h = harness();
        h.store.set_unavailable(true);
        let err = h.tracker.start(&concept("1"), t(0)).await.unwrap_err();
        assert!(matches!(err, EngagementError::StoreUnavailable(_)));
    }
}

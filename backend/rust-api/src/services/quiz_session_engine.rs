use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{EngagementError, Result};
use crate::metrics::{record_guard_conflict, QUIZ_SESSIONS_TOTAL, QUIZ_SIGNALS_TOTAL};
use crate::models::{
    ActivityEntry, EngagementEvent, QuizActivity, QuizFinish, QuizSession, QuizStatus, SignalKind,
};
use crate::services::notifier::Notifier;
use crate::services::quiz_catalog::QuizCatalog;
use crate::store::EngagementStore;

/// Timed quiz attempts: `active -> submitted | abandoned`.
///
/// Manual submits and the expiry sweep both finish through one guarded write
/// that requires `status == active`, so exactly one closer wins.
pub struct QuizSessionEngine {
    store: Arc<dyn EngagementStore>,
    catalog: Arc<dyn QuizCatalog>,
    notifier: Arc<dyn Notifier>,
}

impl QuizSessionEngine {
    pub fn new(
        store: Arc<dyn EngagementStore>,
        catalog: Arc<dyn QuizCatalog>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            catalog,
            notifier,
        }
    }

    pub async fn start(
        &self,
        user_id: &str,
        quiz_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QuizSession> {
        if self
            .store
            .find_quiz_session_for(user_id, quiz_id)
            .await?
            .is_some()
        {
            return Err(EngagementError::AlreadyAttempted);
        }

        let meta = self
            .catalog
            .quiz_meta(quiz_id)
            .await?
            .ok_or_else(|| EngagementError::UnknownQuiz(quiz_id.to_string()))?;
        if meta.duration_minutes <= 0 {
            return Err(EngagementError::InvalidInput(format!(
                "quiz {} has non-positive duration {}",
                quiz_id, meta.duration_minutes
            )));
        }

        let session = QuizSession::begin(user_id, &meta, now)?;
        if !self.store.insert_quiz_session(&session).await? {
            return Err(EngagementError::AlreadyAttempted);
        }

        QUIZ_SESSIONS_TOTAL.with_label_values(&["started"]).inc();
        tracing::info!(
            user_id,
            quiz_id,
            session_id = %session.id,
            expires_at = %session.expires_at,
            lockdown = session.lockdown,
            "quiz session started"
        );
        Ok(session)
    }

    /// Current state of a session, terminal ones included.
    pub async fn get(&self, session_id: &str) -> Result<QuizSession> {
        self.store
            .find_quiz_session(session_id)
            .await?
            .ok_or_else(|| EngagementError::SessionNotFound(session_id.to_string()))
    }

    /// Like `get`, but sessions of other users are reported as missing.
    pub async fn get_owned(&self, user_id: &str, session_id: &str) -> Result<QuizSession> {
        let session = self.get(session_id).await?;
        if session.user_id != user_id {
            return Err(EngagementError::SessionNotFound(session_id.to_string()));
        }
        Ok(session)
    }

    /// Records a lockdown signal. Telemetry only; never finishes the attempt.
    pub async fn record_signal(
        &self,
        session_id: &str,
        kind: SignalKind,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let entry = ActivityEntry {
            event: kind.into(),
            at: now,
        };
        if self.store.record_quiz_signal(session_id, kind, &entry).await? {
            QUIZ_SIGNALS_TOTAL.with_label_values(&[kind.as_str()]).inc();
            tracing::debug!(session_id, kind = kind.as_str(), "quiz signal recorded");
            return Ok(());
        }

        // Tell a missing session apart from a closed or expired one.
        self.get(session_id).await?;
        Err(EngagementError::NotActive)
    }

    /// Manual submit strictly before the deadline.
    pub async fn submit(&self, session_id: &str, now: DateTime<Utc>) -> Result<QuizSession> {
        let mut session = self.get(session_id).await?;
        Self::ensure_submittable(&session, now)?;

        let finish = QuizFinish {
            status: QuizStatus::Submitted,
            ended_at: now,
            auto_submitted: false,
            entry: ActivityEntry {
                event: QuizActivity::Submitted,
                at: now,
            },
            deadline_guard: Some(now),
        };

        if !self.store.finish_quiz_session(session_id, &finish).await? {
            record_guard_conflict("quiz_submit");
            // Someone else closed it since the read; report what they left behind.
            let current = self.get(session_id).await?;
            Self::ensure_submittable(&current, now)?;
            return Err(EngagementError::GuardConflict);
        }

        apply_finish(&mut session, finish);
        QUIZ_SESSIONS_TOTAL.with_label_values(&["submitted"]).inc();
        tracing::info!(
            session_id,
            user_id = %session.user_id,
            quiz_id = %session.quiz_id,
            "quiz session submitted"
        );
        self.notifier.notify(EngagementEvent::QuizSubmitted {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            quiz_id: session.quiz_id.clone(),
            at: now,
        });
        Ok(session)
    }

    fn ensure_submittable(session: &QuizSession, now: DateTime<Utc>) -> Result<()> {
        if !session.is_active() {
            return Err(EngagementError::NotActive);
        }
        if session.is_expired_at(now) {
            return Err(EngagementError::Expired);
        }
        Ok(())
    }

    /// Auto-submits every active session whose deadline has passed. Each one ends
    /// at its own `expires_at`. Returns the number this sweep closed.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.list_due_quiz_sessions(now).await?;
        let mut expired = 0;

        for session in due {
            let finish = QuizFinish {
                status: QuizStatus::Submitted,
                ended_at: session.expires_at,
                auto_submitted: true,
                entry: ActivityEntry {
                    event: QuizActivity::AutoSubmitted,
                    at: session.expires_at,
                },
                deadline_guard: None,
            };

            if !self.store.finish_quiz_session(&session.id, &finish).await? {
                record_guard_conflict("quiz_expire");
                tracing::debug!(session_id = %session.id, "quiz already closed, skipping");
                continue;
            }

            expired += 1;
            QUIZ_SESSIONS_TOTAL
                .with_label_values(&["auto_submitted"])
                .inc();
            tracing::info!(
                session_id = %session.id,
                user_id = %session.user_id,
                quiz_id = %session.quiz_id,
                "quiz session auto-submitted"
            );
            self.notifier.notify(EngagementEvent::QuizAutoSubmitted {
                session_id: session.id.clone(),
                user_id: session.user_id.clone(),
                quiz_id: session.quiz_id.clone(),
                at: session.expires_at,
            });
        }

        Ok(expired)
    }

    /// Administrative invalidation of a running attempt.
    pub async fn abandon(&self, session_id: &str, now: DateTime<Utc>) -> Result<QuizSession> {
        let mut session = self.get(session_id).await?;
        if !session.is_active() {
            return Err(EngagementError::NotActive);
        }

        let finish = QuizFinish {
            status: QuizStatus::Abandoned,
            ended_at: now,
            auto_submitted: false,
            entry: ActivityEntry {
                event: QuizActivity::Abandoned,
                at: now,
            },
            deadline_guard: None,
        };
        if !self.store.finish_quiz_session(session_id, &finish).await? {
            record_guard_conflict("quiz_abandon");
            return Err(EngagementError::NotActive);
        }

        apply_finish(&mut session, finish);
        QUIZ_SESSIONS_TOTAL.with_label_values(&["abandoned"]).inc();
        tracing::warn!(session_id, user_id = %session.user_id, "quiz session abandoned");
        self.notifier.notify(EngagementEvent::QuizAbandoned {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            quiz_id: session.quiz_id.clone(),
            at: now,
        });
        Ok(session)
    }
}

fn apply_finish(session: &mut QuizSession, finish: QuizFinish) {
    session.status = finish.status;
    session.ended_at = Some(finish.ended_at);
    session.auto_submitted = finish.auto_submitted;
    session.activity_log.push(finish.entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notifier::RecordingNotifier;
    use crate::services::quiz_catalog::StaticQuizCatalog;
    use crate::store::MemoryEngagementStore;
    use chrono::{Duration, TimeZone};

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 14, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn engine() -> (QuizSessionEngine, Arc<RecordingNotifier>) {
        let catalog = StaticQuizCatalog::new()
            .with_quiz("q1", 1, true)
            .with_quiz("q2", 30, false)
            .with_quiz("broken", 0, false)
            .with_quiz("endless", 1_000_000_000_000_000, false);
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = QuizSessionEngine::new(
            Arc::new(MemoryEngagementStore::new()),
            Arc::new(catalog),
            notifier.clone(),
        );
        (engine, notifier)
    }

    #[tokio::test]
    async fn test_start_rejects_second_attempt() {
        let (engine, _) = engine();
        let session = engine.start("u1", "q1", t(0)).await.unwrap();
        assert_eq!(session.expires_at, t(60));
        assert!(session.lockdown);

        let err = engine.start("u1", "q1", t(5)).await.unwrap_err();
        assert!(matches!(err, EngagementError::AlreadyAttempted));

        // Other users are independent.
        engine.start("u2", "q1", t(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_validates_quiz() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.start("u1", "missing", t(0)).await.unwrap_err(),
            EngagementError::UnknownQuiz(_)
        ));
        assert!(matches!(
            engine.start("u1", "broken", t(0)).await.unwrap_err(),
            EngagementError::InvalidInput(_)
        ));
        assert!(matches!(
            engine.start("u1", "endless", t(0)).await.unwrap_err(),
            EngagementError::InvalidInput(_)
        ));
        // Nothing was stored, so a fixed catalog entry could still be attempted.
        assert!(engine.store.find_quiz_session_for("u1", "endless").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expire_due_ends_at_deadline() {
        let (engine, notifier) = engine();
        let session = engine.start("u1", "q1", t(0)).await.unwrap();

        assert_eq!(engine.expire_due(t(59)).await.unwrap(), 0);
        assert_eq!(engine.expire_due(session.expires_at).await.unwrap(), 1);

        let stored = engine.get(&session.id).await.unwrap();
        assert_eq!(stored.status, QuizStatus::Submitted);
        assert!(stored.auto_submitted);
        assert_eq!(stored.ended_at, Some(session.expires_at));
        assert!(matches!(
            notifier.events().last(),
            Some(EngagementEvent::QuizAutoSubmitted { .. })
        ));

        // A late sweep finds nothing more to do.
        assert_eq!(engine.expire_due(t(600)).await.unwrap(), 0);
        let again = engine.get(&session.id).await.unwrap();
        assert_eq!(again.ended_at, Some(session.expires_at));
    }

    #[tokio::test]
    async fn test_submit_once_then_not_active() {
        let (engine, _) = engine();
        let session = engine.start("u1", "q2", t(0)).await.unwrap();

        let submitted = engine.submit(&session.id, t(100)).await.unwrap();
        assert_eq!(submitted.status, QuizStatus::Submitted);
        assert_eq!(submitted.ended_at, Some(t(100)));
        assert!(!submitted.auto_submitted);

        let err = engine.submit(&session.id, t(101)).await.unwrap_err();
        assert!(matches!(err, EngagementError::NotActive));
    }

    #[tokio::test]
    async fn test_submit_at_deadline_is_expired() {
        let (engine, _) = engine();
        let session = engine.start("u1", "q1", t(0)).await.unwrap();

        let err = engine.submit(&session.id, t(60)).await.unwrap_err();
        assert!(matches!(err, EngagementError::Expired));
        assert!(engine.get(&session.id).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn test_submit_and_sweep_race_has_one_winner() {
        let (engine, _) = engine();
        let engine = Arc::new(engine);
        let session = engine.start("u1", "q1", t(0)).await.unwrap();

        let submit = {
            let engine = engine.clone();
            let id = session.id.clone();
            tokio::spawn(async move { engine.submit(&id, t(59)).await })
        };
        let sweep = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.expire_due(t(60)).await })
        };

        let submit = submit.await.unwrap();
        let swept = sweep.await.unwrap().unwrap();

        let stored = engine.get(&session.id).await.unwrap();
        assert_eq!(stored.status, QuizStatus::Submitted);
        match submit {
            Ok(_) => {
                assert_eq!(swept, 0);
                assert!(!stored.auto_submitted);
                assert_eq!(stored.ended_at, Some(t(59)));
            }
            Err(err) => {
                assert!(matches!(err, EngagementError::NotActive));
                assert_eq!(swept, 1);
                assert!(stored.auto_submitted);
                assert_eq!(stored.ended_at, Some(t(60)));
            }
        }
    }

    #[tokio::test]
    async fn test_signals_count_until_deadline() {
        let (engine, _) = engine();
        let session = engine.start("u1", "q1", t(0)).await.unwrap();

        engine
            .record_signal(&session.id, SignalKind::TabSwitch, t(10))
            .await
            .unwrap();
        engine
            .record_signal(&session.id, SignalKind::FocusLoss, t(20))
            .await
            .unwrap();
        let err = engine
            .record_signal(&session.id, SignalKind::TabSwitch, t(60))
            .await
            .unwrap_err();
        assert!(matches!(err, EngagementError::NotActive));

        let stored = engine.get(&session.id).await.unwrap();
        assert_eq!(stored.tab_switches, 1);
        assert_eq!(stored.focus_losses, 1);
        assert_eq!(stored.activity_log.len(), 2);
        assert!(stored.is_active());
    }

    #[tokio::test]
    async fn test_signal_on_missing_session() {
        let (engine, _) = engine();
        let err = engine
            .record_signal("nope", SignalKind::FocusLoss, t(0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngagementError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_abandon_is_terminal() {
        let (engine, _) = engine();
        let session = engine.start("u1", "q2", t(0)).await.unwrap();

        let abandoned = engine.abandon(&session.id, t(30)).await.unwrap();
        assert_eq!(abandoned.status, QuizStatus::Abandoned);
        assert!(matches!(
            engine.submit(&session.id, t(31)).await.unwrap_err(),
            EngagementError::NotActive
        ));
        assert!(matches!(
            engine.abandon(&session.id, t(32)).await.unwrap_err(),
            EngagementError::NotActive
        ));
    }

    #[tokio::test]
    async fn test_get_owned_hides_foreign_sessions() {
        let (engine, _) = engine();
        let session = engine.start("u1", "q2", t(0)).await.unwrap();

        assert!(engine.get_owned("u1", &session.id).await.is_ok());
        assert!(matches!(
            engine.get_owned("u2", &session.id).await.unwrap_err(),
            EngagementError::SessionNotFound(_)
        ));
    }
}

//! Persistence contract for engagement rows.
//!
//! Rows are shared between request handlers and scheduler sweeps. Every mutating
//! method is a single conditional write: it either applies atomically against the
//! expected state and returns `true`, or matches nothing and returns `false`.
//! Callers never read-modify-write a row outside these methods.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::Result;
use crate::models::{
    ActivityCategory, ActivityEntry, DailyStudyTime, QuizFinish, QuizSession, SignalKind,
    StudyKey, StudySession, UserStreak,
};

pub mod memory;
pub mod mongo;

pub use memory::MemoryEngagementStore;
pub use mongo::MongoEngagementStore;

/// Upper bound on rows a single sweep picks up; the rest wait for the next tick.
pub const SWEEP_BATCH_SIZE: usize = 500;

/// Guarded close of a study session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseStudySession {
    /// `last_activity_at` observed when the close was decided. The write only
    /// applies if the row still carries exactly this value.
    pub expected_last_activity: DateTime<Utc>,
    /// Closing boundary, stored as the final `last_activity_at`.
    pub end: DateTime<Utc>,
    pub duration_seconds: i64,
}

#[async_trait]
pub trait EngagementStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    // Study sessions

    async fn find_active_study_session(&self, key: &StudyKey) -> Result<Option<StudySession>>;

    /// `false` when an active session already exists for the key.
    async fn insert_study_session(&self, session: &StudySession) -> Result<bool>;

    /// Sets `last_activity_at = max(stored, at)` on an active session.
    /// `false` when the session is no longer active.
    async fn advance_study_activity(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Deactivates an active session, writing its final duration and leaving it
    /// unfolded. `false` when the session was closed or touched since it was read.
    async fn close_study_session(&self, session_id: &str, close: CloseStudySession)
        -> Result<bool>;

    async fn list_idle_study_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<StudySession>>;

    /// Closed sessions whose duration has not reached a day row yet.
    async fn list_unfolded_study_sessions(&self) -> Result<Vec<StudySession>>;

    /// `false` when the session is active or already marked.
    async fn mark_study_session_folded(&self, session_id: &str) -> Result<bool>;

    // Daily aggregates

    /// Upserts the day row and adds a closed session's `seconds` to its total,
    /// at most once per session. `false` when the session was already counted.
    async fn add_daily_study_time(
        &self,
        session_id: &str,
        user_id: &str,
        date: NaiveDate,
        seconds: i64,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn increment_daily_counter(
        &self,
        user_id: &str,
        date: NaiveDate,
        category: ActivityCategory,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn find_daily_study_time(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyStudyTime>>;

    async fn total_study_seconds(&self, user_id: &str) -> Result<i64>;

    // Streaks

    async fn find_streak(&self, user_id: &str) -> Result<Option<UserStreak>>;

    /// `false` when the user already has a streak row.
    async fn insert_streak(&self, streak: &UserStreak) -> Result<bool>;

    /// Compare-and-set against the row the caller read. Any change since then,
    /// including a sweep reset of `current_streak`, makes the write miss.
    async fn update_streak(&self, expected: &UserStreak, streak: &UserStreak) -> Result<bool>;

    /// Zeroes `current_streak` on rows last active before `cutoff`. Returns rows changed.
    async fn reset_stale_streaks(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // Quiz sessions

    /// `false` when the user already has an attempt for the quiz.
    async fn insert_quiz_session(&self, session: &QuizSession) -> Result<bool>;

    async fn find_quiz_session(&self, session_id: &str) -> Result<Option<QuizSession>>;

    async fn find_quiz_session_for(
        &self,
        user_id: &str,
        quiz_id: &str,
    ) -> Result<Option<QuizSession>>;

    /// Bumps the signal counter and appends to the log while the session is
    /// active and `expires_at > entry.at`.
    async fn record_quiz_signal(
        &self,
        session_id: &str,
        kind: SignalKind,
        entry: &ActivityEntry,
    ) -> Result<bool>;

    /// Moves an active session to a terminal status.
    async fn finish_quiz_session(&self, session_id: &str, finish: &QuizFinish) -> Result<bool>;

    async fn list_due_quiz_sessions(&self, now: DateTime<Utc>) -> Result<Vec<QuizSession>>;
}

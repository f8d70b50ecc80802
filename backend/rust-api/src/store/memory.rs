//! In-process store with the same per-row atomicity as the MongoDB one.
//! Every method holds the table lock for its whole conditional write.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use super::{CloseStudySession, EngagementStore, SWEEP_BATCH_SIZE};
use crate::error::{EngagementError, Result};
use crate::models::{
    ActivityCategory, ActivityEntry, DailyStudyTime, QuizFinish, QuizSession, QuizStatus,
    SignalKind, StudyKey, StudySession, UserStreak,
};

#[derive(Default)]
struct Tables {
    study_sessions: HashMap<String, StudySession>,
    daily: HashMap<(String, NaiveDate), DailyStudyTime>,
    /// Sessions whose seconds are already in a day row.
    counted_sessions: HashSet<String>,
    streaks: HashMap<String, UserStreak>,
    quiz_sessions: HashMap<String, QuizSession>,
}

#[derive(Default)]
pub struct MemoryEngagementStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    failing_daily_writes: AtomicUsize,
}

impl MemoryEngagementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `StoreUnavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fails the next `count` study-time writes to day rows, leaving every other call alone.
    pub fn fail_daily_writes(&self, count: usize) {
        self.failing_daily_writes.store(count, Ordering::SeqCst);
    }

    pub async fn study_session(&self, session_id: &str) -> Option<StudySession> {
        self.tables
            .lock()
            .await
            .study_sessions
            .get(session_id)
            .cloned()
    }

    pub async fn study_sessions_for(&self, user_id: &str) -> Vec<StudySession> {
        let tables = self.tables.lock().await;
        let mut sessions: Vec<StudySession> = tables
            .study_sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    fn check_daily_write(&self) -> Result<()> {
        let injected = self
            .failing_daily_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EngagementError::StoreUnavailable(
                "memory store day-row write failed".to_string(),
            ));
        }
        self.check()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngagementError::StoreUnavailable(
                "memory store switched off".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EngagementStore for MemoryEngagementStore {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn find_active_study_session(&self, key: &StudyKey) -> Result<Option<StudySession>> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .study_sessions
            .values()
            .find(|s| s.is_active && s.key() == *key)
            .cloned())
    }

    async fn insert_study_session(&self, session: &StudySession) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let key = session.key();
        let duplicate = tables
            .study_sessions
            .values()
            .any(|s| s.is_active && s.key() == key);
        if duplicate || tables.study_sessions.contains_key(&session.id) {
            return Ok(false);
        }
        tables
            .study_sessions
            .insert(session.id.clone(), session.clone());
        Ok(true)
    }

    async fn advance_study_activity(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        match tables.study_sessions.get_mut(session_id) {
            Some(session) if session.is_active => {
                session.last_activity_at = session.last_activity_at.max(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close_study_session(
        &self,
        session_id: &str,
        close: CloseStudySession,
    ) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        match tables.study_sessions.get_mut(session_id) {
            Some(session)
                if session.is_active
                    && session.last_activity_at == close.expected_last_activity =>
            {
                session.is_active = false;
                session.last_activity_at = close.end;
                session.duration_seconds = close.duration_seconds;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_idle_study_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<StudySession>> {
        self.check()?;
        let tables = self.tables.lock().await;
        let mut idle: Vec<StudySession> = tables
            .study_sessions
            .values()
            .filter(|s| s.is_active && s.last_activity_at < cutoff)
            .cloned()
            .collect();
        idle.sort_by_key(|s| s.last_activity_at);
        idle.truncate(SWEEP_BATCH_SIZE);
        Ok(idle)
    }

    async fn list_unfolded_study_sessions(&self) -> Result<Vec<StudySession>> {
        self.check()?;
        let tables = self.tables.lock().await;
        let mut pending: Vec<StudySession> = tables
            .study_sessions
            .values()
            .filter(|s| !s.is_active && !s.folded)
            .cloned()
            .collect();
        pending.sort_by_key(|s| s.last_activity_at);
        pending.truncate(SWEEP_BATCH_SIZE);
        Ok(pending)
    }

    async fn mark_study_session_folded(&self, session_id: &str) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        match tables.study_sessions.get_mut(session_id) {
            Some(session) if !session.is_active && !session.folded => {
                session.folded = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_daily_study_time(
        &self,
        session_id: &str,
        user_id: &str,
        date: NaiveDate,
        seconds: i64,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_daily_write()?;
        let mut tables = self.tables.lock().await;
        if !tables.counted_sessions.insert(session_id.to_string()) {
            return Ok(false);
        }
        let row = tables
            .daily
            .entry((user_id.to_string(), date))
            .or_insert_with(|| DailyStudyTime::empty(user_id, date, at));
        row.total_seconds += seconds.max(0);
        row.last_activity_at = row.last_activity_at.max(at);
        Ok(true)
    }

    async fn increment_daily_counter(
        &self,
        user_id: &str,
        date: NaiveDate,
        category: ActivityCategory,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let row = tables
            .daily
            .entry((user_id.to_string(), date))
            .or_insert_with(|| DailyStudyTime::empty(user_id, date, at));
        row.counters.increment(category);
        row.last_activity_at = row.last_activity_at.max(at);
        Ok(())
    }

    async fn find_daily_study_time(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyStudyTime>> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables.daily.get(&(user_id.to_string(), date)).cloned())
    }

    async fn total_study_seconds(&self, user_id: &str) -> Result<i64> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .daily
            .values()
            .filter(|d| d.user_id == user_id)
            .map(|d| d.total_seconds)
            .sum())
    }

    async fn find_streak(&self, user_id: &str) -> Result<Option<UserStreak>> {
        self.check()?;
        Ok(self.tables.lock().await.streaks.get(user_id).cloned())
    }

    async fn insert_streak(&self, streak: &UserStreak) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        if tables.streaks.contains_key(&streak.user_id) {
            return Ok(false);
        }
        tables
            .streaks
            .insert(streak.user_id.clone(), streak.clone());
        Ok(true)
    }

    async fn update_streak(&self, expected: &UserStreak, streak: &UserStreak) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        match tables.streaks.get_mut(&streak.user_id) {
            Some(row) if *row == *expected => {
                *row = streak.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_stale_streaks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let mut changed = 0;
        for row in tables.streaks.values_mut() {
            if row.last_activity_at < cutoff && row.current_streak > 0 {
                row.current_streak = 0;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn insert_quiz_session(&self, session: &QuizSession) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let duplicate = tables
            .quiz_sessions
            .values()
            .any(|s| s.user_id == session.user_id && s.quiz_id == session.quiz_id);
        if duplicate {
            return Ok(false);
        }
        tables
            .quiz_sessions
            .insert(session.id.clone(), session.clone());
        Ok(true)
    }

    async fn find_quiz_session(&self, session_id: &str) -> Result<Option<QuizSession>> {
        self.check()?;
        Ok(self
            .tables
            .lock()
            .await
            .quiz_sessions
            .get(session_id)
            .cloned())
    }

    async fn find_quiz_session_for(
        &self,
        user_id: &str,
        quiz_id: &str,
    ) -> Result<Option<QuizSession>> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .quiz_sessions
            .values()
            .find(|s| s.user_id == user_id && s.quiz_id == quiz_id)
            .cloned())
    }

    async fn record_quiz_signal(
        &self,
        session_id: &str,
        kind: SignalKind,
        entry: &ActivityEntry,
    ) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        match tables.quiz_sessions.get_mut(session_id) {
            Some(session) if session.is_active() && session.expires_at > entry.at => {
                match kind {
                    SignalKind::TabSwitch => session.tab_switches += 1,
                    SignalKind::FocusLoss => session.focus_losses += 1,
                }
                session.activity_log.push(entry.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_quiz_session(&self, session_id: &str, finish: &QuizFinish) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.quiz_sessions.get_mut(session_id) else {
            return Ok(false);
        };
        if session.status != QuizStatus::Active {
            return Ok(false);
        }
        if let Some(deadline) = finish.deadline_guard {
            if session.expires_at <= deadline {
                return Ok(false);
            }
        }

        session.status = finish.status;
        session.ended_at = Some(finish.ended_at);
        session.auto_submitted = finish.auto_submitted;
        session.activity_log.push(finish.entry.clone());
        Ok(true)
    }

    async fn list_due_quiz_sessions(&self, now: DateTime<Utc>) -> Result<Vec<QuizSession>> {
        self.check()?;
        let tables = self.tables.lock().await;
        let mut due: Vec<QuizSession> = tables
            .quiz_sessions
            .values()
            .filter(|s| s.is_active() && s.expires_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.expires_at);
        due.truncate(SWEEP_BATCH_SIZE);
        Ok(due)
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngagementError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizStatus {
    Active,
    /// Terminal success, manual or automatic. Older rows say "completed".
    #[serde(alias = "completed")]
    Submitted,
    /// Administrative invalidation.
    Abandoned,
}

impl QuizStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuizStatus::Active => "active",
            QuizStatus::Submitted => "submitted",
            QuizStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, QuizStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    TabSwitch,
    FocusLoss,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::TabSwitch => "tab_switch",
            SignalKind::FocusLoss => "focus_loss",
        }
    }

    /// Stored counter that this signal increments.
    pub fn counter_field(&self) -> &'static str {
        match self {
            SignalKind::TabSwitch => "tab_switches",
            SignalKind::FocusLoss => "focus_losses",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizActivity {
    TabSwitch,
    FocusLoss,
    Submitted,
    AutoSubmitted,
    Abandoned,
}

impl From<SignalKind> for QuizActivity {
    fn from(kind: SignalKind) -> Self {
        match kind {
            SignalKind::TabSwitch => QuizActivity::TabSwitch,
            SignalKind::FocusLoss => QuizActivity::FocusLoss,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub event: QuizActivity,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizSession {
    pub id: String,
    pub user_id: String,
    pub quiz_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Fixed at start; never moves.
    pub expires_at: DateTime<Utc>,
    pub tab_switches: i64,
    pub focus_losses: i64,
    pub activity_log: Vec<ActivityEntry>,
    pub auto_submitted: bool,
    pub status: QuizStatus,
    pub lockdown: bool,
}

impl QuizSession {
    /// Fresh attempt with an empty log. Fails when the deadline is not representable.
    pub fn begin(user_id: &str, meta: &QuizMeta, now: DateTime<Utc>) -> Result<Self> {
        let expires_at = meta.deadline_from(now).ok_or_else(|| {
            EngagementError::InvalidInput(format!(
                "quiz {} duration of {} minutes is out of range",
                meta.quiz_id, meta.duration_minutes
            ))
        })?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            quiz_id: meta.quiz_id.clone(),
            started_at: now,
            ended_at: None,
            expires_at,
            tab_switches: 0,
            focus_losses: 0,
            activity_log: Vec::new(),
            auto_submitted: false,
            status: QuizStatus::Active,
            lockdown: meta.lockdown,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == QuizStatus::Active
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        if !self.is_active() {
            return 0;
        }
        (self.expires_at - now).num_seconds().max(0)
    }

    pub fn signal_count(&self, kind: SignalKind) -> i64 {
        match kind {
            SignalKind::TabSwitch => self.tab_switches,
            SignalKind::FocusLoss => self.focus_losses,
        }
    }
}

/// What the quiz-content side tells us about a quiz at start time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizMeta {
    pub quiz_id: String,
    pub duration_minutes: i64,
    #[serde(default)]
    pub lockdown: bool,
}

impl QuizMeta {
    /// `start + duration_minutes`, or `None` when that overflows.
    pub fn deadline_from(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Duration::try_minutes(self.duration_minutes)
            .and_then(|duration| start.checked_add_signed(duration))
    }
}

/// Terminal write applied by a guarded finish.
#[derive(Debug, Clone, PartialEq)]
pub struct QuizFinish {
    pub status: QuizStatus,
    pub ended_at: DateTime<Utc>,
    pub auto_submitted: bool,
    pub entry: ActivityEntry,
    /// When set, the write only applies while `expires_at > deadline_guard`.
    pub deadline_guard: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct RecordSignalRequest {
    pub kind: SignalKind,
}

#[derive(Debug, Serialize)]
pub struct QuizSessionView {
    #[serde(flatten)]
    pub session: QuizSession,
    pub remaining_seconds: i64,
}

impl QuizSessionView {
    pub fn at(session: QuizSession, now: DateTime<Utc>) -> Self {
        let remaining_seconds = session.remaining_seconds(now);
        Self {
            session,
            remaining_seconds,
        }
    }
}

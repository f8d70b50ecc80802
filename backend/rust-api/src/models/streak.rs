use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStreak {
    pub user_id: String,
    pub current_streak: i64,
    /// Historical maximum of `current_streak`.
    pub longest_streak: i64,
    pub last_activity_at: DateTime<Utc>,
}

impl UserStreak {
    pub fn first(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            current_streak: 1,
            longest_streak: 1,
            last_activity_at: now,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StreakView {
    pub user_id: String,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl StreakView {
    pub fn of(user_id: &str, streak: Option<UserStreak>) -> Self {
        match streak {
            Some(s) => Self {
                user_id: s.user_id,
                current_streak: s.current_streak,
                longest_streak: s.longest_streak,
                last_activity_at: Some(s.last_activity_at),
            },
            None => Self {
                user_id: user_id.to_string(),
                current_streak: 0,
                longest_streak: 0,
                last_activity_at: None,
            },
        }
    }
}

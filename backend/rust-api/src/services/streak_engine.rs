use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::{EngagementError, Result};
use crate::metrics::{record_guard_conflict, STREAK_UPDATES_TOTAL};
use crate::models::{EngagementEvent, UserStreak};
use crate::services::notifier::Notifier;
use crate::store::EngagementStore;
use crate::utils::time::Calendar;

const MAX_GUARD_RETRIES: usize = 3;

/// A streak survives 24 hours without activity; the sweep zeroes it after that.
const STALE_AFTER_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    SameDay,
    Extended,
    Reset,
    /// Earlier day than the stored activity; nothing to change.
    Stale,
}

impl Step {
    fn label(self) -> &'static str {
        match self {
            Step::SameDay => "same_day",
            Step::Extended => "extended",
            Step::Reset => "reset",
            Step::Stale => "out_of_order",
        }
    }
}

pub struct StreakEngine {
    store: Arc<dyn EngagementStore>,
    notifier: Arc<dyn Notifier>,
    calendar: Calendar,
    milestones: Vec<i64>,
}

impl StreakEngine {
    pub fn new(
        store: Arc<dyn EngagementStore>,
        notifier: Arc<dyn Notifier>,
        calendar: Calendar,
        milestones: Vec<i64>,
    ) -> Self {
        Self {
            store,
            notifier,
            calendar,
            milestones,
        }
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<UserStreak>> {
        self.store.find_streak(user_id).await
    }

    fn next(&self, prev: &UserStreak, now: DateTime<Utc>) -> (Step, UserStreak) {
        let mut next = prev.clone();
        let step = match self.calendar.days_between(prev.last_activity_at, now) {
            d if d < 0 => Step::Stale,
            0 => Step::SameDay,
            1 => {
                next.current_streak += 1;
                Step::Extended
            }
            _ => {
                next.current_streak = 1;
                Step::Reset
            }
        };
        next.longest_streak = next.longest_streak.max(next.current_streak);
        next.last_activity_at = prev.last_activity_at.max(now);
        (step, next)
    }

    /// Applies one activity event to the user's streak and returns the stored result.
    pub async fn record_activity(&self, user_id: &str, now: DateTime<Utc>) -> Result<UserStreak> {
        for _ in 0..MAX_GUARD_RETRIES {
            let Some(prev) = self.store.find_streak(user_id).await? else {
                let first = UserStreak::first(user_id, now);
                if self.store.insert_streak(&first).await? {
                    STREAK_UPDATES_TOTAL.with_label_values(&["started"]).inc();
                    tracing::info!(user_id, "streak started");
                    self.check_milestone(&first, now);
                    return Ok(first);
                }
                record_guard_conflict("streak_insert");
                continue;
            };

            let (step, next) = self.next(&prev, now);
            if next == prev {
                STREAK_UPDATES_TOTAL.with_label_values(&[step.label()]).inc();
                return Ok(prev);
            }

            if self.store.update_streak(&prev, &next).await? {
                STREAK_UPDATES_TOTAL.with_label_values(&[step.label()]).inc();
                tracing::debug!(
                    user_id,
                    step = step.label(),
                    current_streak = next.current_streak,
                    longest_streak = next.longest_streak,
                    "streak updated"
                );
                if step == Step::Extended {
                    self.check_milestone(&next, now);
                }
                return Ok(next);
            }
            record_guard_conflict("streak_update");
        }

        Err(EngagementError::GuardConflict)
    }

    fn check_milestone(&self, streak: &UserStreak, now: DateTime<Utc>) {
        if self.milestones.contains(&streak.current_streak) {
            tracing::info!(
                user_id = %streak.user_id,
                streak = streak.current_streak,
                "streak milestone reached"
            );
            self.notifier.notify(EngagementEvent::StreakMilestone {
                user_id: streak.user_id.clone(),
                streak: streak.current_streak,
                at: now,
            });
        }
    }

    /// Zeroes every current streak last active more than 24 hours before `now`.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - Duration::hours(STALE_AFTER_HOURS);
        let reset = self.store.reset_stale_streaks(cutoff).await?;
        if reset > 0 {
            STREAK_UPDATES_TOTAL
                .with_label_values(&["expired"])
                .inc_by(reset);
        }
        Ok(reset)
    }
}

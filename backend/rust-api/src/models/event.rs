use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::study_session::ResourceType;

/// Transitions handed to the notification side. Delivery is best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngagementEvent {
    StreakMilestone {
        user_id: String,
        streak: i64,
        at: DateTime<Utc>,
    },
    QuizSubmitted {
        session_id: String,
        user_id: String,
        quiz_id: String,
        at: DateTime<Utc>,
    },
    QuizAutoSubmitted {
        session_id: String,
        user_id: String,
        quiz_id: String,
        at: DateTime<Utc>,
    },
    QuizAbandoned {
        session_id: String,
        user_id: String,
        quiz_id: String,
        at: DateTime<Utc>,
    },
    StudySessionClosed {
        session_id: String,
        user_id: String,
        resource_type: ResourceType,
        resource_id: String,
        duration_seconds: i64,
        idle: bool,
    },
}

impl EngagementEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            EngagementEvent::StreakMilestone { .. } => "streak-milestone",
            EngagementEvent::QuizSubmitted { .. } => "quiz-submitted",
            EngagementEvent::QuizAutoSubmitted { .. } => "quiz-auto-submitted",
            EngagementEvent::QuizAbandoned { .. } => "quiz-abandoned",
            EngagementEvent::StudySessionClosed { .. } => "study-session-closed",
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            EngagementEvent::StreakMilestone { user_id, .. }
            | EngagementEvent::QuizSubmitted { user_id, .. }
            | EngagementEvent::QuizAutoSubmitted { user_id, .. }
            | EngagementEvent::QuizAbandoned { user_id, .. }
            | EngagementEvent::StudySessionClosed { user_id, .. } => user_id,
        }
    }
}

pub mod event;
pub mod quiz_session;
pub mod streak;
pub mod study_session;

pub use event::EngagementEvent;
pub use quiz_session::{
    ActivityEntry, QuizActivity, QuizFinish, QuizMeta, QuizSession, QuizSessionView, QuizStatus,
    RecordSignalRequest, SignalKind,
};
pub use streak::{StreakView, UserStreak};
pub use study_session::{
    ActivityCategory, ActivityCounters, DailyStudyTime, DailyStudyTimeQuery, DailyStudyTimeView,
    RecordActionRequest, ResourceType, StudyKey, StudySession, StudyVisitRequest,
    TotalStudyTimeResponse,
};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Concept,
    Paper,
    Osce,
    Spot,
    Today,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Concept => "concept",
            ResourceType::Paper => "paper",
            ResourceType::Osce => "osce",
            ResourceType::Spot => "spot",
            ResourceType::Today => "today",
        }
    }

    /// Daily counter bumped when a new visit to this kind of resource opens.
    /// The "today" dashboard is tracked for time only.
    pub fn view_category(&self) -> Option<ActivityCategory> {
        match self {
            ResourceType::Concept => Some(ActivityCategory::Concept),
            ResourceType::Paper => Some(ActivityCategory::Paper),
            ResourceType::Osce => Some(ActivityCategory::Osce),
            ResourceType::Spot => Some(ActivityCategory::Spot),
            ResourceType::Today => None,
        }
    }
}

/// Identity of an active visit: one open session per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StudyKey {
    pub user_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
}

impl StudyKey {
    pub fn new(
        user_id: impl Into<String>,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            resource_type,
            resource_id: resource_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySession {
    pub id: String,
    pub user_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub is_active: bool,
    /// Zero while active; written once when the session closes.
    pub duration_seconds: i64,
    /// Set once the closed duration has been added to its day row.
    pub folded: bool,
}

impl StudySession {
    pub fn open(key: &StudyKey, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: key.user_id.clone(),
            resource_type: key.resource_type,
            resource_id: key.resource_id.clone(),
            started_at: now,
            last_activity_at: now,
            is_active: true,
            duration_seconds: 0,
            folded: false,
        }
    }

    pub fn key(&self) -> StudyKey {
        StudyKey::new(self.user_id.clone(), self.resource_type, self.resource_id.clone())
    }

    /// Whole seconds between start and `end`, never negative.
    pub fn duration_until(&self, end: DateTime<Utc>) -> i64 {
        (end - self.started_at).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    Concept,
    Mcq,
    Saq,
    Osce,
    Spot,
    Paper,
}

impl ActivityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityCategory::Concept => "concept",
            ActivityCategory::Mcq => "mcq",
            ActivityCategory::Saq => "saq",
            ActivityCategory::Osce => "osce",
            ActivityCategory::Spot => "spot",
            ActivityCategory::Paper => "paper",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounters {
    #[serde(default)]
    pub concept: i64,
    #[serde(default)]
    pub mcq: i64,
    #[serde(default)]
    pub saq: i64,
    #[serde(default)]
    pub osce: i64,
    #[serde(default)]
    pub spot: i64,
    #[serde(default)]
    pub paper: i64,
}

impl ActivityCounters {
    pub fn get(&self, category: ActivityCategory) -> i64 {
        match category {
            ActivityCategory::Concept => self.concept,
            ActivityCategory::Mcq => self.mcq,
            ActivityCategory::Saq => self.saq,
            ActivityCategory::Osce => self.osce,
            ActivityCategory::Spot => self.spot,
            ActivityCategory::Paper => self.paper,
        }
    }

    pub fn increment(&mut self, category: ActivityCategory) {
        let slot = match category {
            ActivityCategory::Concept => &mut self.concept,
            ActivityCategory::Mcq => &mut self.mcq,
            ActivityCategory::Saq => &mut self.saq,
            ActivityCategory::Osce => &mut self.osce,
            ActivityCategory::Spot => &mut self.spot,
            ActivityCategory::Paper => &mut self.paper,
        };
        *slot += 1;
    }
}

/// Per-user, per-calendar-day rollup. Counters and total only grow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStudyTime {
    pub user_id: String,
    pub date: NaiveDate,
    pub last_activity_at: DateTime<Utc>,
    pub counters: ActivityCounters,
    pub total_seconds: i64,
}

impl DailyStudyTime {
    pub fn empty(user_id: &str, date: NaiveDate, at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            date,
            last_activity_at: at,
            counters: ActivityCounters::default(),
            total_seconds: 0,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct StudyVisitRequest {
    pub resource_type: ResourceType,
    #[validate(length(min = 1, max = 128))]
    pub resource_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RecordActionRequest {
    pub category: ActivityCategory,
}

#[derive(Debug, Deserialize)]
pub struct DailyStudyTimeQuery {
    pub date: Option<NaiveDate>,
}

/// Day view that reads as zeros when the user has no row for the date.
#[derive(Debug, Serialize)]
pub struct DailyStudyTimeView {
    pub user_id: String,
    pub date: NaiveDate,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub counters: ActivityCounters,
    pub total_seconds: i64,
}

impl DailyStudyTimeView {
    pub fn of(user_id: &str, date: NaiveDate, row: Option<DailyStudyTime>) -> Self {
        match row {
            Some(row) => Self {
                user_id: row.user_id,
                date: row.date,
                last_activity_at: Some(row.last_activity_at),
                counters: row.counters,
                total_seconds: row.total_seconds,
            },
            None => Self {
                user_id: user_id.to_string(),
                date,
                last_activity_at: None,
                counters: ActivityCounters::default(),
                total_seconds: 0,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TotalStudyTimeResponse {
    pub user_id: String,
    pub total_seconds: i64,
}

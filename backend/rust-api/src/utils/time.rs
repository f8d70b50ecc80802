use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use mongodb::bson::DateTime as BsonDateTime;

pub fn chrono_to_bson(dt: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(dt.timestamp_millis())
}

pub fn bson_to_chrono(dt: BsonDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Process-wide calendar used for every "same day" decision.
/// Users in distant zones can be misclassified right around midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calendar {
    offset: FixedOffset,
}

impl Calendar {
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// Falls back to UTC when the offset is out of range (more than a day).
    pub fn from_offset_minutes(minutes: i32) -> Self {
        match FixedOffset::east_opt(minutes.saturating_mul(60)) {
            Some(offset) => Self { offset },
            None => {
                tracing::warn!(minutes, "invalid calendar offset, using UTC");
                Self::utc()
            }
        }
    }

    pub fn date_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// Calendar days from `earlier` to `later`; negative if `later` is on an earlier day.
    pub fn days_between(&self, earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
        (self.date_of(later) - self.date_of(earlier)).num_days()
    }
}

impl Default for Calendar {
    fn default() -> Self {
        Self::utc()
    }
}

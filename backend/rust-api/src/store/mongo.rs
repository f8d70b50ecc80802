use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, DateTime as BsonDateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};

use super::{CloseStudySession, EngagementStore, SWEEP_BATCH_SIZE};
use crate::error::{EngagementError, Result};
use crate::metrics::track_db_operation;
use crate::models::{
    ActivityCategory, ActivityCounters, ActivityEntry, DailyStudyTime, QuizActivity, QuizFinish,
    QuizSession, QuizStatus, ResourceType, SignalKind, StudyKey, StudySession, UserStreak,
};
use crate::utils::time::{bson_to_chrono, chrono_to_bson};

const STUDY_SESSIONS: &str = "study_sessions";
const DAILY_STUDY_TIME: &str = "daily_study_time";
const USER_STREAKS: &str = "user_streaks";
const QUIZ_SESSIONS: &str = "quiz_sessions";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Serialize, Deserialize)]
struct StudySessionDoc {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    resource_type: ResourceType,
    resource_id: String,
    started_at: BsonDateTime,
    last_activity_at: BsonDateTime,
    is_active: bool,
    #[serde(default)]
    duration_seconds: i64,
    /// Rows written before the flag existed were folded inline.
    #[serde(default = "folded_by_default")]
    folded: bool,
}

fn folded_by_default() -> bool {
    true
}

impl From<&StudySession> for StudySessionDoc {
    fn from(s: &StudySession) -> Self {
        Self {
            id: s.id.clone(),
            user_id: s.user_id.clone(),
            resource_type: s.resource_type,
            resource_id: s.resource_id.clone(),
            started_at: chrono_to_bson(s.started_at),
            last_activity_at: chrono_to_bson(s.last_activity_at),
            is_active: s.is_active,
            duration_seconds: s.duration_seconds,
            folded: s.folded,
        }
    }
}

impl From<StudySessionDoc> for StudySession {
    fn from(d: StudySessionDoc) -> Self {
        Self {
            id: d.id,
            user_id: d.user_id,
            resource_type: d.resource_type,
            resource_id: d.resource_id,
            started_at: bson_to_chrono(d.started_at),
            last_activity_at: bson_to_chrono(d.last_activity_at),
            is_active: d.is_active,
            duration_seconds: d.duration_seconds,
            folded: d.folded,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DailyStudyTimeDoc {
    user_id: String,
    date: String,
    last_activity_at: BsonDateTime,
    #[serde(default)]
    counters: ActivityCounters,
    #[serde(default)]
    total_seconds: i64,
}

impl TryFrom<DailyStudyTimeDoc> for DailyStudyTime {
    type Error = EngagementError;

    fn try_from(d: DailyStudyTimeDoc) -> Result<Self> {
        let date = NaiveDate::parse_from_str(&d.date, DATE_FORMAT).map_err(|e| {
            EngagementError::StoreUnavailable(format!("corrupt date '{}': {}", d.date, e))
        })?;
        Ok(Self {
            user_id: d.user_id,
            date,
            last_activity_at: bson_to_chrono(d.last_activity_at),
            counters: d.counters,
            total_seconds: d.total_seconds,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UserStreakDoc {
    #[serde(rename = "_id")]
    user_id: String,
    current_streak: i64,
    longest_streak: i64,
    last_activity_at: BsonDateTime,
}

impl From<&UserStreak> for UserStreakDoc {
    fn from(s: &UserStreak) -> Self {
        Self {
            user_id: s.user_id.clone(),
            current_streak: s.current_streak,
            longest_streak: s.longest_streak,
            last_activity_at: chrono_to_bson(s.last_activity_at),
        }
    }
}

impl From<UserStreakDoc> for UserStreak {
    fn from(d: UserStreakDoc) -> Self {
        Self {
            user_id: d.user_id,
            current_streak: d.current_streak,
            longest_streak: d.longest_streak,
            last_activity_at: bson_to_chrono(d.last_activity_at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ActivityEntryDoc {
    event: QuizActivity,
    at: BsonDateTime,
}

impl From<&ActivityEntry> for ActivityEntryDoc {
    fn from(e: &ActivityEntry) -> Self {
        Self {
            event: e.event,
            at: chrono_to_bson(e.at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QuizSessionDoc {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    quiz_id: String,
    started_at: BsonDateTime,
    #[serde(default)]
    ended_at: Option<BsonDateTime>,
    expires_at: BsonDateTime,
    #[serde(default)]
    tab_switches: i64,
    #[serde(default)]
    focus_losses: i64,
    #[serde(default)]
    activity_log: Vec<ActivityEntryDoc>,
    #[serde(default)]
    auto_submitted: bool,
    status: QuizStatus,
    #[serde(default)]
    lockdown: bool,
}

impl From<&QuizSession> for QuizSessionDoc {
    fn from(s: &QuizSession) -> Self {
        Self {
            id: s.id.clone(),
            user_id: s.user_id.clone(),
            quiz_id: s.quiz_id.clone(),
            started_at: chrono_to_bson(s.started_at),
            ended_at: s.ended_at.map(chrono_to_bson),
            expires_at: chrono_to_bson(s.expires_at),
            tab_switches: s.tab_switches,
            focus_losses: s.focus_losses,
            activity_log: s.activity_log.iter().map(ActivityEntryDoc::from).collect(),
            auto_submitted: s.auto_submitted,
            status: s.status,
            lockdown: s.lockdown,
        }
    }
}

impl From<QuizSessionDoc> for QuizSession {
    fn from(d: QuizSessionDoc) -> Self {
        Self {
            id: d.id,
            user_id: d.user_id,
            quiz_id: d.quiz_id,
            started_at: bson_to_chrono(d.started_at),
            ended_at: d.ended_at.map(bson_to_chrono),
            expires_at: bson_to_chrono(d.expires_at),
            tab_switches: d.tab_switches,
            focus_losses: d.focus_losses,
            activity_log: d
                .activity_log
                .into_iter()
                .map(|e| ActivityEntry {
                    event: e.event,
                    at: bson_to_chrono(e.at),
                })
                .collect(),
            auto_submitted: d.auto_submitted,
            status: d.status,
            lockdown: d.lockdown,
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match *err.kind {
        ErrorKind::Write(WriteFailure::WriteError(ref we)) => we.code == 11000,
        ErrorKind::Command(ref ce) => ce.code == 11000,
        _ => false,
    }
}

fn date_key(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

#[derive(Clone)]
pub struct MongoEngagementStore {
    mongo: Database,
}

impl MongoEngagementStore {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    fn study_sessions(&self) -> Collection<StudySessionDoc> {
        self.mongo.collection(STUDY_SESSIONS)
    }

    fn daily(&self) -> Collection<DailyStudyTimeDoc> {
        self.mongo.collection(DAILY_STUDY_TIME)
    }

    fn streaks(&self) -> Collection<UserStreakDoc> {
        self.mongo.collection(USER_STREAKS)
    }

    fn quiz_sessions(&self) -> Collection<QuizSessionDoc> {
        self.mongo.collection(QUIZ_SESSIONS)
    }

    /// Creates the uniqueness constraints the guarded writes rely on.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let active_visit = IndexModel::builder()
            .keys(doc! { "user_id": 1, "resource_type": 1, "resource_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("uniq_active_visit".to_string())
                    .unique(true)
                    .partial_filter_expression(doc! { "is_active": true })
                    .build(),
            )
            .build();
        let idle_scan = IndexModel::builder()
            .keys(doc! { "is_active": 1, "last_activity_at": 1 })
            .options(IndexOptions::builder().name("idle_scan".to_string()).build())
            .build();
        let unfolded_scan = IndexModel::builder()
            .keys(doc! { "last_activity_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("unfolded_scan".to_string())
                    .partial_filter_expression(doc! { "is_active": false, "folded": false })
                    .build(),
            )
            .build();
        self.study_sessions()
            .create_indexes([active_visit, idle_scan, unfolded_scan])
            .await?;

        let day = IndexModel::builder()
            .keys(doc! { "user_id": 1, "date": 1 })
            .options(
                IndexOptions::builder()
                    .name("uniq_user_day".to_string())
                    .unique(true)
                    .build(),
            )
            .build();
        self.daily().create_index(day).await?;

        let stale_scan = IndexModel::builder()
            .keys(doc! { "last_activity_at": 1 })
            .options(IndexOptions::builder().name("stale_scan".to_string()).build())
            .build();
        self.streaks().create_index(stale_scan).await?;

        let attempt = IndexModel::builder()
            .keys(doc! { "user_id": 1, "quiz_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("uniq_attempt".to_string())
                    .unique(true)
                    .build(),
            )
            .build();
        let due_scan = IndexModel::builder()
            .keys(doc! { "status": 1, "expires_at": 1 })
            .options(IndexOptions::builder().name("due_scan".to_string()).build())
            .build();
        self.quiz_sessions()
            .create_indexes([attempt, due_scan])
            .await?;

        tracing::info!("Engagement indexes ensured");
        Ok(())
    }

    /// Day-row upsert. Two concurrent first writes of the day can both miss and
    /// race on the unique index; the loser retries once and then matches. A
    /// second duplicate means the row exists but `filter` excludes it, so the
    /// write is reported as not applied.
    async fn upsert_daily(&self, filter: Document, update: Document) -> Result<bool> {
        for attempt in 0..2 {
            let result = track_db_operation(
                "upsert",
                DAILY_STUDY_TIME,
                self.daily()
                    .update_one(filter.clone(), update.clone())
                    .upsert(true),
            )
            .await;
            match result {
                Ok(_) => return Ok(true),
                Err(e) if is_duplicate_key(&e) && attempt == 0 => {
                    tracing::debug!(?filter, "daily row upsert raced, retrying");
                }
                Err(e) if is_duplicate_key(&e) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl EngagementStore for MongoEngagementStore {
    async fn ping(&self) -> Result<()> {
        self.mongo.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn find_active_study_session(&self, key: &StudyKey) -> Result<Option<StudySession>> {
        let filter = doc! {
            "user_id": &key.user_id,
            "resource_type": key.resource_type.as_str(),
            "resource_id": &key.resource_id,
            "is_active": true,
        };
        let found =
            track_db_operation("find_one", STUDY_SESSIONS, self.study_sessions().find_one(filter))
                .await?;
        Ok(found.map(StudySession::from))
    }

    async fn insert_study_session(&self, session: &StudySession) -> Result<bool> {
        let doc = StudySessionDoc::from(session);
        match track_db_operation(
            "insert_one",
            STUDY_SESSIONS,
            self.study_sessions().insert_one(&doc),
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn advance_study_activity(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = track_db_operation(
            "update_one",
            STUDY_SESSIONS,
            self.study_sessions().update_one(
                doc! { "_id": session_id, "is_active": true },
                doc! { "$max": { "last_activity_at": chrono_to_bson(at) } },
            ),
        )
        .await?;
        Ok(result.matched_count == 1)
    }

    async fn close_study_session(
        &self,
        session_id: &str,
        close: CloseStudySession,
    ) -> Result<bool> {
        let result = track_db_operation(
            "update_one",
            STUDY_SESSIONS,
            self.study_sessions().update_one(
                doc! {
                    "_id": session_id,
                    "is_active": true,
                    "last_activity_at": chrono_to_bson(close.expected_last_activity),
                },
                doc! { "$set": {
                    "is_active": false,
                    "last_activity_at": chrono_to_bson(close.end),
                    "duration_seconds": close.duration_seconds,
                    "folded": false,
                } },
            ),
        )
        .await?;
        Ok(result.matched_count == 1)
    }

    async fn list_idle_study_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<StudySession>> {
        let cursor = track_db_operation(
            "find",
            STUDY_SESSIONS,
            self.study_sessions()
                .find(doc! {
                    "is_active": true,
                    "last_activity_at": { "$lt": chrono_to_bson(cutoff) },
                })
                .sort(doc! { "last_activity_at": 1 })
                .limit(SWEEP_BATCH_SIZE as i64),
        )
        .await?;
        let docs: Vec<StudySessionDoc> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(StudySession::from).collect())
    }

    async fn list_unfolded_study_sessions(&self) -> Result<Vec<StudySession>> {
        let cursor = track_db_operation(
            "find",
            STUDY_SESSIONS,
            self.study_sessions()
                .find(doc! { "is_active": false, "folded": false })
                .sort(doc! { "last_activity_at": 1 })
                .limit(SWEEP_BATCH_SIZE as i64),
        )
        .await?;
        let docs: Vec<StudySessionDoc> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(StudySession::from).collect())
    }

    async fn mark_study_session_folded(&self, session_id: &str) -> Result<bool> {
        let result = track_db_operation(
            "update_one",
            STUDY_SESSIONS,
            self.study_sessions().update_one(
                doc! { "_id": session_id, "is_active": false, "folded": false },
                doc! { "$set": { "folded": true } },
            ),
        )
        .await?;
        Ok(result.matched_count == 1)
    }

    async fn add_daily_study_time(
        &self,
        session_id: &str,
        user_id: &str,
        date: NaiveDate,
        seconds: i64,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        // The day row remembers which sessions it already holds, so a retried
        // fold cannot count the same seconds twice.
        self.upsert_daily(
            doc! {
                "user_id": user_id,
                "date": date_key(date),
                "counted_sessions": { "$ne": session_id },
            },
            doc! {
                "$inc": { "total_seconds": seconds.max(0) },
                "$max": { "last_activity_at": chrono_to_bson(at) },
                "$push": { "counted_sessions": session_id },
            },
        )
        .await
    }

    async fn increment_daily_counter(
        &self,
        user_id: &str,
        date: NaiveDate,
        category: ActivityCategory,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let counter = format!("counters.{}", category.as_str());
        let mut inc = Document::new();
        inc.insert(counter, 1i64);
        inc.insert("total_seconds", 0i64);
        self.upsert_daily(
            doc! { "user_id": user_id, "date": date_key(date) },
            doc! {
                "$inc": inc,
                "$max": { "last_activity_at": chrono_to_bson(at) },
            },
        )
        .await?;
        Ok(())
    }

    async fn find_daily_study_time(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyStudyTime>> {
        let found = track_db_operation(
            "find_one",
            DAILY_STUDY_TIME,
            self.daily()
                .find_one(doc! { "user_id": user_id, "date": date_key(date) }),
        )
        .await?;
        found.map(DailyStudyTime::try_from).transpose()
    }

    async fn total_study_seconds(&self, user_id: &str) -> Result<i64> {
        let pipeline = vec![
            doc! { "$match": { "user_id": user_id } },
            doc! { "$group": { "_id": null, "total": { "$sum": "$total_seconds" } } },
        ];
        let mut cursor = track_db_operation(
            "aggregate",
            DAILY_STUDY_TIME,
            self.daily().aggregate(pipeline),
        )
        .await?;

        match cursor.try_next().await? {
            Some(row) => Ok(row
                .get_i64("total")
                .or_else(|_| row.get_i32("total").map(|v| v as i64))
                .unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn find_streak(&self, user_id: &str) -> Result<Option<UserStreak>> {
        let found = track_db_operation(
            "find_one",
            USER_STREAKS,
            self.streaks().find_one(doc! { "_id": user_id }),
        )
        .await?;
        Ok(found.map(UserStreak::from))
    }

    async fn insert_streak(&self, streak: &UserStreak) -> Result<bool> {
        let doc = UserStreakDoc::from(streak);
        match track_db_operation("insert_one", USER_STREAKS, self.streaks().insert_one(&doc)).await
        {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_streak(&self, expected: &UserStreak, streak: &UserStreak) -> Result<bool> {
        let result = track_db_operation(
            "update_one",
            USER_STREAKS,
            self.streaks().update_one(
                doc! {
                    "_id": &streak.user_id,
                    "current_streak": expected.current_streak,
                    "longest_streak": expected.longest_streak,
                    "last_activity_at": chrono_to_bson(expected.last_activity_at),
                },
                doc! { "$set": {
                    "current_streak": streak.current_streak,
                    "longest_streak": streak.longest_streak,
                    "last_activity_at": chrono_to_bson(streak.last_activity_at),
                } },
            ),
        )
        .await?;
        Ok(result.matched_count == 1)
    }

    async fn reset_stale_streaks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = track_db_operation(
            "update_many",
            USER_STREAKS,
            self.streaks().update_many(
                doc! {
                    "last_activity_at": { "$lt": chrono_to_bson(cutoff) },
                    "current_streak": { "$gt": 0 },
                },
                doc! { "$set": { "current_streak": 0i64 } },
            ),
        )
        .await?;
        Ok(result.modified_count)
    }

    async fn insert_quiz_session(&self, session: &QuizSession) -> Result<bool> {
        let doc = QuizSessionDoc::from(session);
        match track_db_operation(
            "insert_one",
            QUIZ_SESSIONS,
            self.quiz_sessions().insert_one(&doc),
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_quiz_session(&self, session_id: &str) -> Result<Option<QuizSession>> {
        let found = track_db_operation(
            "find_one",
            QUIZ_SESSIONS,
            self.quiz_sessions().find_one(doc! { "_id": session_id }),
        )
        .await?;
        Ok(found.map(QuizSession::from))
    }

    async fn find_quiz_session_for(
        &self,
        user_id: &str,
        quiz_id: &str,
    ) -> Result<Option<QuizSession>> {
        let found = track_db_operation(
            "find_one",
            QUIZ_SESSIONS,
            self.quiz_sessions()
                .find_one(doc! { "user_id": user_id, "quiz_id": quiz_id }),
        )
        .await?;
        Ok(found.map(QuizSession::from))
    }

    async fn record_quiz_signal(
        &self,
        session_id: &str,
        kind: SignalKind,
        entry: &ActivityEntry,
    ) -> Result<bool> {
        let mut inc = Document::new();
        inc.insert(kind.counter_field(), 1i64);
        let at = chrono_to_bson(entry.at);
        let entry = to_bson(&ActivityEntryDoc::from(entry))?;

        let result = track_db_operation(
            "update_one",
            QUIZ_SESSIONS,
            self.quiz_sessions().update_one(
                doc! {
                    "_id": session_id,
                    "status": QuizStatus::Active.as_str(),
                    "expires_at": { "$gt": at },
                },
                doc! { "$inc": inc, "$push": { "activity_log": entry } },
            ),
        )
        .await?;
        Ok(result.matched_count == 1)
    }

    async fn finish_quiz_session(&self, session_id: &str, finish: &QuizFinish) -> Result<bool> {
        let mut filter = doc! {
            "_id": session_id,
            "status": QuizStatus::Active.as_str(),
        };
        if let Some(deadline) = finish.deadline_guard {
            filter.insert("expires_at", doc! { "$gt": chrono_to_bson(deadline) });
        }
        let entry = to_bson(&ActivityEntryDoc::from(&finish.entry))?;

        let result = track_db_operation(
            "update_one",
            QUIZ_SESSIONS,
            self.quiz_sessions().update_one(
                filter,
                doc! {
                    "$set": {
                        "status": finish.status.as_str(),
                        "ended_at": chrono_to_bson(finish.ended_at),
                        "auto_submitted": finish.auto_submitted,
                    },
                    "$push": { "activity_log": entry },
                },
            ),
        )
        .await?;
        Ok(result.matched_count == 1)
    }

    async fn list_due_quiz_sessions(&self, now: DateTime<Utc>) -> Result<Vec<QuizSession>> {
        let cursor = track_db_operation(
            "find",
            QUIZ_SESSIONS,
            self.quiz_sessions()
                .find(doc! {
                    "status": QuizStatus::Active.as_str(),
                    "expires_at": { "$lte": chrono_to_bson(now) },
                })
                .sort(doc! { "expires_at": 1 })
                .limit(SWEEP_BATCH_SIZE as i64),
        )
        .await?;
        let docs: Vec<QuizSessionDoc> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(QuizSession::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuizMeta;
    use chrono::TimeZone;

    #[test]
    fn test_quiz_doc_roundtrip_preserves_fields() {
        let now = Utc.timestamp_millis_opt(1_717_236_000_123).unwrap();
        let meta = QuizMeta {
            quiz_id: "q1".to_string(),
            duration_minutes: 45,
            lockdown: true,
        };
        let mut session = QuizSession::begin("u1", &meta, now).unwrap();
        session.tab_switches = 2;

        let restored = QuizSession::from(QuizSessionDoc::from(&session));
        assert_eq!(restored, session);
    }

    #[test]
    fn test_study_doc_stores_snake_case_resource_type() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let session = StudySession::open(&StudyKey::new("u1", ResourceType::Osce, "o1"), now);
        let bson = to_bson(&StudySessionDoc::from(&session)).unwrap();
        let doc = bson.as_document().unwrap();

        assert_eq!(doc.get_str("resource_type").unwrap(), "osce");
        assert_eq!(doc.get_str("_id").unwrap(), session.id);
    }

    #[test]
    fn test_date_key_format() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 9).unwrap();
        assert_eq!(date_key(date), "2024-02-09");
    }

    #[test]
    fn test_study_doc_without_flag_reads_as_folded() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let session = StudySession::open(&StudyKey::new("u1", ResourceType::Spot, "s1"), now);
        let mut doc = mongodb::bson::to_document(&StudySessionDoc::from(&session)).unwrap();
        assert_eq!(doc.get_bool("folded").unwrap(), false);

        doc.remove("folded");
        let legacy: StudySessionDoc = mongodb::bson::from_document(doc).unwrap();
        assert!(StudySession::from(legacy).folded);
    }
}

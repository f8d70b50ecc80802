use std::collections::HashMap;

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::Database;
use serde::Deserialize;

use crate::error::Result;
use crate::metrics::track_db_operation;
use crate::models::QuizMeta;

/// Quiz-content side: supplies timing and lockdown settings at attempt start.
#[async_trait]
pub trait QuizCatalog: Send + Sync {
    async fn quiz_meta(&self, quiz_id: &str) -> Result<Option<QuizMeta>>;
}

#[derive(Debug, Deserialize)]
struct QuizDoc {
    #[serde(rename = "_id")]
    id: String,
    duration_minutes: i64,
    #[serde(default)]
    lockdown: bool,
}

/// Reads quiz settings from the `quizzes` collection owned by the content service.
#[derive(Clone)]
pub struct MongoQuizCatalog {
    mongo: Database,
}

impl MongoQuizCatalog {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }
}

#[async_trait]
impl QuizCatalog for MongoQuizCatalog {
    async fn quiz_meta(&self, quiz_id: &str) -> Result<Option<QuizMeta>> {
        let collection = self.mongo.collection::<QuizDoc>("quizzes");
        let found = track_db_operation(
            "find_one",
            "quizzes",
            collection.find_one(doc! { "_id": quiz_id }),
        )
        .await?;

        Ok(found.map(|q| QuizMeta {
            quiz_id: q.id,
            duration_minutes: q.duration_minutes,
            lockdown: q.lockdown,
        }))
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticQuizCatalog {
    quizzes: HashMap<String, QuizMeta>,
}

impl StaticQuizCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quiz(mut self, quiz_id: &str, duration_minutes: i64, lockdown: bool) -> Self {
        self.quizzes.insert(
            quiz_id.to_string(),
            QuizMeta {
                quiz_id: quiz_id.to_string(),
                duration_minutes,
                lockdown,
            },
        );
        self
    }
}

#[async_trait]
impl QuizCatalog for StaticQuizCatalog {
    async fn quiz_meta(&self, quiz_id: &str) -> Result<Option<QuizMeta>> {
        Ok(self.quizzes.get(quiz_id).cloned())
    }
}

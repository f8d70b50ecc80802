use std::sync::Mutex;

use redis::aio::ConnectionManager;

use crate::models::EngagementEvent;

pub const EVENTS_CHANNEL: &str = "engagement:events";

/// Fire-and-forget sink for engagement transitions. Implementations must not
/// block and must not fail the transition that produced the event.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: EngagementEvent);
}

/// Publishes events as JSON on a Redis Pub/Sub channel.
#[derive(Clone)]
pub struct RedisNotifier {
    redis: ConnectionManager,
    channel: String,
}

impl RedisNotifier {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            channel: EVENTS_CHANNEL.to_string(),
        }
    }
}

impl Notifier for RedisNotifier {
    fn notify(&self, event: EngagementEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(event = event.event_name(), error = %e, "failed to encode event");
                return;
            }
        };

        let mut conn = self.redis.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let result: redis::RedisResult<()> = redis::cmd("PUBLISH")
                .arg(&channel)
                .arg(&payload)
                .query_async(&mut conn)
                .await;
            match result {
                Ok(()) => tracing::debug!(
                    channel = %channel,
                    event = event.event_name(),
                    user_id = event.user_id(),
                    "event published"
                ),
                Err(e) => tracing::warn!(
                    channel = %channel,
                    event = event.event_name(),
                    error = %e,
                    "failed to publish event"
                ),
            }
        });
    }
}

/// Writes events to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: EngagementEvent) {
        tracing::info!(
            event = event.event_name(),
            user_id = event.user_id(),
            "engagement event"
        );
    }
}

/// Keeps every event in memory so tests can assert on them.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<EngagementEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngagementEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: EngagementEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

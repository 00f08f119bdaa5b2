//! Domain event types for the learning-state engine.
//!
//! This module provides the foundational data types that the store,
//! projection, and publisher modules all depend on. No I/O occurs here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The closed set of domain event types the engine understands.
///
/// Serialized in SCREAMING_SNAKE_CASE so journals and wire payloads read
/// as `"EXERCISE_COMPLETED"` etc. The projection ignores variants it has
/// no fold rule for, and deserialization of an unknown string fails at
/// the boundary rather than inside the fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    LearningStarted,
    ExerciseCompleted,
    SkillMastered,
    DifficultyAdjusted,
    EmotionDetected,
    InteractionRecorded,
    AchievementUnlocked,
    AiFeedbackGiven,
    MetacognitionTriggered,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde rename so logs and the wire format agree.
        let s = serde_json::to_value(self).expect("EventType serializes to a string");
        f.write_str(s.as_str().expect("EventType serializes to a string"))
    }
}

/// An immutable domain event belonging to one learner aggregate.
///
/// Events for the same `aggregate_id` are totally ordered by their append
/// sequence in the store. `event_id` is the idempotency key: re-appending
/// an event with an id the store has already seen is a no-op.
///
/// `payload` is an open JSON map whose shape depends on `event_type`;
/// `metadata` carries tracing/debug context and is never read by the
/// projection fold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    /// Globally unique identifier, used for idempotent append.
    pub event_id: Uuid,
    /// Which kind of domain event this is.
    pub event_type: EventType,
    /// The learner this event belongs to. Events for one aggregate are
    /// totally ordered; there is no cross-aggregate ordering guarantee.
    pub aggregate_id: String,
    /// Groups events within one learning session. Does not order events
    /// across sessions.
    pub session_id: String,
    /// Assigned at construction; the store clamps it monotonically
    /// non-decreasing within an aggregate's append sequence.
    pub timestamp: DateTime<Utc>,
    /// Open key/value map whose shape depends on `event_type`.
    pub payload: Value,
    /// Optional tracing/debug context, never semantically required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl LearningEvent {
    /// Create a new event with a fresh v4 `event_id` and the current time.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The domain event kind.
    /// * `aggregate_id` - The learner this event belongs to.
    /// * `session_id` - The learning session grouping key.
    /// * `payload` - JSON payload matching the event type's shape.
    pub fn new(
        event_type: EventType,
        aggregate_id: impl Into<String>,
        session_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            aggregate_id: aggregate_id.into(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            payload,
            metadata: None,
        }
    }

    /// Attach tracing/debug metadata.
    ///
    /// # Returns
    ///
    /// The updated event with `metadata` set.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Override the generated `event_id`.
    ///
    /// Used by callers that carry their own idempotency key across retried
    /// delivery, so a retry maps onto the same stored event.
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }
}

//! Learning-state projection: a read model rebuilt from event history.
//!
//! The projection is a pure, order-preserving left-fold over one
//! aggregate's events. It never reads the clock, generates randomness,
//! or performs I/O inside the fold, so a fixed event sequence always
//! yields an identical state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{EventType, LearningEvent};
use crate::store::EventStore;

/// One recorded difficulty adjustment, kept in chronological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifficultyChange {
    /// When the adjustment event was appended.
    pub timestamp: DateTime<Utc>,
    /// Difficulty level before the adjustment, as reported by the payload.
    pub old_level: Value,
    /// Difficulty level after the adjustment.
    pub new_level: Value,
    /// Why the adjustment was made (e.g. `"skill_mastery"`).
    pub reason: String,
}

/// Read-optimized learner state derived from an aggregate's event history.
///
/// # Contract
///
/// - [`apply`](LearnerProgress::apply) must be deterministic: the same
///   event sequence always produces the same state. `emotion_patterns`
///   uses a `BTreeMap` so serialization order is stable too.
/// - Event types with no fold rule are silently ignored for forward
///   compatibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearnerProgress {
    /// Number of `EXERCISE_COMPLETED` events folded.
    pub exercises_completed: u64,
    /// Sum of payload `time_spent` values, in seconds.
    pub total_time_spent: f64,
    /// Skills mastered, in first-mastery order. Set semantics: re-mastering
    /// an already-present skill is a no-op.
    pub skills_mastered: Vec<String>,
    /// Count of detected emotions keyed by emotion name.
    pub emotion_patterns: BTreeMap<String, u64>,
    /// Chronological list of difficulty adjustments.
    pub difficulty_history: Vec<DifficultyChange>,
    /// Number of `LEARNING_STARTED` events folded.
    pub sessions_started: u64,
    /// Number of `INTERACTION_RECORDED` events folded.
    pub interactions: u64,
    /// Number of `ACHIEVEMENT_UNLOCKED` events folded.
    pub achievements: u64,
}

impl LearnerProgress {
    /// Apply a single event to the state.
    ///
    /// Payload fields that are missing or of the wrong type degrade to
    /// no-ops for that rule rather than failing the fold.
    pub fn apply(&mut self, event: &LearningEvent) {
        match event.event_type {
            EventType::ExerciseCompleted => {
                self.exercises_completed += 1;
                if let Some(time) = event.payload.get("time_spent").and_then(Value::as_f64) {
                    self.total_time_spent += time;
                }
            }
            EventType::SkillMastered => {
                if let Some(skill) = event.payload.get("skill_name").and_then(Value::as_str) {
                    if !self.skills_mastered.iter().any(|s| s == skill) {
                        self.skills_mastered.push(skill.to_string());
                    }
                }
            }
            EventType::EmotionDetected => {
                if let Some(emotion) = event.payload.get("emotion").and_then(Value::as_str) {
                    *self.emotion_patterns.entry(emotion.to_string()).or_default() += 1;
                }
            }
            EventType::DifficultyAdjusted => {
                self.difficulty_history.push(DifficultyChange {
                    timestamp: event.timestamp,
                    old_level: event.payload.get("old_level").cloned().unwrap_or(Value::Null),
                    new_level: event.payload.get("new_level").cloned().unwrap_or(Value::Null),
                    reason: event
                        .payload
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified")
                        .to_string(),
                });
            }
            EventType::LearningStarted => self.sessions_started += 1,
            EventType::InteractionRecorded => self.interactions += 1,
            EventType::AchievementUnlocked => self.achievements += 1,
            // No fold rule; ignored for forward compatibility.
            _ => {}
        }
    }

    /// Fold an event sequence into a fresh state.
    pub fn fold<'a>(events: impl IntoIterator<Item = &'a LearningEvent>) -> Self {
        let mut state = Self::default();
        for event in events {
            state.apply(event);
        }
        state
    }
}

/// Rebuild a learner's current state by replaying their full history.
///
/// Pure with respect to the returned events: interleaving other
/// aggregates' events in the store does not change the result.
pub async fn rebuild(store: &EventStore, aggregate_id: &str) -> LearnerProgress {
    LearnerProgress::fold(&store.query(aggregate_id).await)
}

/// Rebuild using the store's snapshot cache when one is available.
///
/// Deserializes the snapshot state and folds only the events appended
/// after it. A snapshot that fails to deserialize is treated as a cache
/// miss and the full history is replayed; the result must always equal
/// [`rebuild`].
pub async fn rebuild_with_snapshot(store: &EventStore, aggregate_id: &str) -> LearnerProgress {
    let events = store.query(aggregate_id).await;
    if let Some(snapshot) = store.load_snapshot(aggregate_id).await {
        match serde_json::from_value::<LearnerProgress>(snapshot.derived_state) {
            Ok(mut state) if snapshot.events_applied <= events.len() => {
                for event in &events[snapshot.events_applied..] {
                    state.apply(event);
                }
                return state;
            }
            Ok(_) => {
                tracing::warn!(
                    aggregate_id,
                    "snapshot ahead of event log; replaying full history"
                );
            }
            Err(e) => {
                tracing::warn!(
                    aggregate_id,
                    error = %e,
                    "snapshot state does not deserialize; replaying full history"
                );
            }
        }
    }
    LearnerProgress::fold(&events)
}

/// Derived analytics computed from a [`LearnerProgress`] state.
///
/// Pure functions of the state; safe to recompute on every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerAnalytics {
    /// Exercises completed per hour of recorded time. Zero when no time
    /// has been recorded.
    pub learning_velocity: f64,
    /// Number of distinct skills mastered.
    pub skill_diversity: u64,
    /// Share of detected emotions that are positive, in `[0, 1]`.
    /// Defaults to `1.0` when no emotions were detected.
    pub emotional_stability: f64,
    /// Skills mastered per completed exercise. Zero when no exercises
    /// have been completed.
    pub learning_efficiency: f64,
}

/// Emotions counted as positive for the stability ratio.
const POSITIVE_EMOTIONS: &[&str] = &["engaged", "happy", "curious", "confident", "calm"];

impl From<&LearnerProgress> for LearnerAnalytics {
    fn from(progress: &LearnerProgress) -> Self {
        let hours = progress.total_time_spent / 3600.0;
        let learning_velocity = if hours > 0.0 {
            progress.exercises_completed as f64 / hours
        } else {
            0.0
        };

        let total_emotions: u64 = progress.emotion_patterns.values().sum();
        let positive: u64 = progress
            .emotion_patterns
            .iter()
            .filter(|(name, _)| POSITIVE_EMOTIONS.contains(&name.as_str()))
            .map(|(_, count)| count)
            .sum();
        let emotional_stability = if total_emotions > 0 {
            positive as f64 / total_emotions as f64
        } else {
            1.0
        };

        let learning_efficiency = if progress.exercises_completed > 0 {
            progress.skills_mastered.len() as f64 / progress.exercises_completed as f64
        } else {
            0.0
        };

        Self {
            learning_velocity,
            skill_diversity: progress.skills_mastered.len() as u64,
            emotional_stability,
            learning_efficiency,
        }
    }
}

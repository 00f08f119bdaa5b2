//! Application layer gluing the store, publisher, projection, and
//! orchestrator together for the HTTP surface.

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppendError, WorkflowError};
use crate::event::{EventType, LearningEvent};
use crate::orchestrator::{Orchestrator, WorkflowKind, WorkflowResult};
use crate::projection::{rebuild_with_snapshot, LearnerAnalytics, LearnerProgress};
use crate::publisher::EventPublisher;
use crate::registry::ServiceHealth;
use crate::store::AppendOutcome;

/// Outcome of recording one skill-progress submission.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SkillProgressOutcome {
    /// The id of the appended event.
    pub event_id: Uuid,
    /// Mastery level computed from the exercise result.
    pub mastery: f64,
    /// Whether the submission crossed the mastery threshold.
    pub mastered: bool,
}

/// Coordinates the engine's write and read paths for callers.
///
/// One instance is constructed at process start and shared by the HTTP
/// handlers; tests build their own with fresh components.
pub struct AdaptiveEngine {
    publisher: Arc<EventPublisher>,
    orchestrator: Arc<Orchestrator>,
    mastery_threshold: f64,
}

impl AdaptiveEngine {
    /// Wire an engine over already-constructed components.
    pub fn new(
        publisher: Arc<EventPublisher>,
        orchestrator: Arc<Orchestrator>,
        mastery_threshold: f64,
    ) -> Self {
        Self {
            publisher,
            orchestrator,
            mastery_threshold,
        }
    }

    /// Append an `INTERACTION_RECORDED` event and trigger background
    /// adaptive-response evaluation.
    ///
    /// The background task publishes an `EMOTION_DETECTED` event when the
    /// interaction payload carries an `emotion` field; its failures are
    /// logged, never surfaced to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError`] if the interaction event cannot be
    /// appended.
    pub async fn record_interaction(
        &self,
        user_id: &str,
        session_id: &str,
        payload: Value,
        event_id: Option<Uuid>,
    ) -> Result<AppendOutcome, AppendError> {
        let mut event = LearningEvent::new(
            EventType::InteractionRecorded,
            user_id,
            session_id,
            payload.clone(),
        );
        if let Some(id) = event_id {
            event = event.with_event_id(id);
        }
        let outcome = self.publisher.publish(event).await?;

        // Background evaluation: fire-and-forget relative to the caller.
        if !outcome.duplicate {
            let publisher = self.publisher.clone();
            let user_id = user_id.to_string();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if let Some(emotion) = payload.get("emotion").and_then(Value::as_str) {
                    let event = LearningEvent::new(
                        EventType::EmotionDetected,
                        user_id.clone(),
                        session_id,
                        json!({"emotion": emotion, "source": "interaction"}),
                    );
                    if let Err(e) = publisher.publish(event).await {
                        tracing::warn!(
                            user_id,
                            error = %e,
                            "background adaptive evaluation failed"
                        );
                    }
                }
            });
        }
        Ok(outcome)
    }

    /// Record an exercise result for a skill.
    ///
    /// The mastery level is the submitted score clamped to `[0, 1]`. At
    /// or above the mastery threshold this appends `SKILL_MASTERED` and a
    /// difficulty-increase `DIFFICULTY_ADJUSTED` event; below it, an
    /// `EXERCISE_COMPLETED` progress event.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError`] if any event cannot be appended.
    pub async fn record_skill_progress(
        &self,
        user_id: &str,
        session_id: &str,
        skill: &str,
        score: f64,
        time_spent: f64,
    ) -> Result<SkillProgressOutcome, AppendError> {
        let mastery = score.clamp(0.0, 1.0);
        let mastered = mastery >= self.mastery_threshold;

        let event = if mastered {
            LearningEvent::new(
                EventType::SkillMastered,
                user_id,
                session_id,
                json!({"skill_name": skill, "mastery": mastery, "time_spent": time_spent}),
            )
        } else {
            LearningEvent::new(
                EventType::ExerciseCompleted,
                user_id,
                session_id,
                json!({"skill_name": skill, "mastery": mastery, "time_spent": time_spent}),
            )
        };
        let outcome = self.publisher.publish(event).await?;

        if mastered {
            // Difficulty-increase adaptation, continuing from the last
            // recorded level.
            let progress = rebuild_with_snapshot(self.publisher.store(), user_id).await;
            let old_level = progress
                .difficulty_history
                .last()
                .and_then(|change| change.new_level.as_i64())
                .unwrap_or(1);
            let adjustment = LearningEvent::new(
                EventType::DifficultyAdjusted,
                user_id,
                session_id,
                json!({
                    "old_level": old_level,
                    "new_level": old_level + 1,
                    "reason": "skill_mastery",
                    "skill_name": skill,
                }),
            );
            self.publisher.publish(adjustment).await?;
        }

        Ok(SkillProgressOutcome {
            event_id: outcome.event_id,
            mastery,
            mastered,
        })
    }

    /// Run the `adaptive_learning` workflow, then append a
    /// `METACOGNITION_TRIGGERED` event carrying its decision.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError`] on synchronous failures only (stopped
    /// broker, append failure); degraded workflow results are returned
    /// normally.
    pub async fn run_adaptive_learning(
        &self,
        user_id: &str,
        session_id: &str,
        context: Value,
    ) -> Result<WorkflowResult, WorkflowError> {
        let result = self
            .orchestrator
            .run_workflow(WorkflowKind::AdaptiveLearning, context, user_id)
            .await?;

        let decision = result
            .step_results
            .get("difficulty_decision")
            .and_then(|step| step.value())
            .cloned()
            .unwrap_or(Value::Null);
        let event = LearningEvent::new(
            EventType::MetacognitionTriggered,
            user_id,
            session_id,
            json!({
                "workflow_id": result.workflow_id,
                "completion": result.completion,
                "decision": decision,
            }),
        );
        self.publisher.publish(event).await?;
        Ok(result)
    }

    /// Run the `multimodal_analysis` workflow over whichever modalities
    /// are present in `input`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::BrokerStopped`] if the broker is down.
    pub async fn run_multimodal(
        &self,
        user_id: &str,
        input: Value,
    ) -> Result<WorkflowResult, WorkflowError> {
        self.orchestrator
            .run_workflow(WorkflowKind::MultimodalAnalysis, input, user_id)
            .await
    }

    /// Rebuild a learner's state and derive analytics from it.
    pub async fn user_progress(&self, user_id: &str) -> (LearnerProgress, LearnerAnalytics) {
        let progress = rebuild_with_snapshot(self.publisher.store(), user_id).await;
        let analytics = LearnerAnalytics::from(&progress);
        (progress, analytics)
    }

    /// Snapshot capability-service health.
    pub async fn services_health(&self) -> std::collections::BTreeMap<String, ServiceHealth> {
        self.orchestrator.get_services_health().await
    }
}

//! Multi-step workflow coordination across capability services.
//!
//! The orchestrator dispatches `AI_REQUEST` messages over the broker,
//! either sequentially or fanned out in parallel, and joins the replies
//! with one bounded deadline per invocation. Every dispatched message
//! carries `correlation_id == workflow_id`, and the orchestrator routes
//! replies back to the owning invocation through a pending-reply table.
//! A stalled capability service degrades the joined result; it never
//! blocks the orchestrator indefinitely.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::{FnHandler, MessageBroker, MessageHandler};
use crate::error::WorkflowError;
use crate::message::{MessageType, ServiceMessage};
use crate::registry::{ServiceHealth, ServiceRegistry};

/// Service name stamped on messages the orchestrator produces.
const ORCHESTRATOR_SERVICE: &str = "orchestrator";

/// The fixed registry of named workflows.
///
/// Resolved at compile time through this enum rather than a string-keyed
/// function map, so an unknown name is an error at the boundary instead
/// of a silent fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Sequential: emotion analysis, then comprehension analysis, then a
    /// difficulty-adjustment decision.
    AdaptiveLearning,
    /// Fan-out: one request per present modality (text/image/audio),
    /// joined with a bounded wait.
    MultimodalAnalysis,
    /// Fan-out: peer matching and group dynamics analysis.
    CollaborativeLearning,
}

impl FromStr for WorkflowKind {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adaptive_learning" => Ok(Self::AdaptiveLearning),
            "multimodal_analysis" => Ok(Self::MultimodalAnalysis),
            "collaborative_learning" => Ok(Self::CollaborativeLearning),
            other => Err(WorkflowError::UnknownWorkflow(other.to_string())),
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AdaptiveLearning => "adaptive_learning",
            Self::MultimodalAnalysis => "multimodal_analysis",
            Self::CollaborativeLearning => "collaborative_learning",
        };
        f.write_str(name)
    }
}

/// Where a workflow invocation ended up.
///
/// The full per-invocation state machine is `Pending -> Dispatched ->
/// AwaitingReplies -> {Completed | Partial | TimedOut}`; the first three
/// states are transient and only the terminal ones appear on a returned
/// [`WorkflowResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowCompletion {
    Pending,
    Dispatched,
    AwaitingReplies,
    /// Every expected step reported.
    Completed,
    /// Some steps reported before the deadline; the rest are omitted or
    /// marked failed.
    Partial,
    /// No step reported before the deadline.
    TimedOut,
}

/// Outcome of a single workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum StepResult {
    /// The capability service replied; `data` is its response payload.
    Ok(Value),
    /// The step could not produce a result (timeout, dispatch refusal).
    Failed(String),
}

impl StepResult {
    /// The response payload, if the step succeeded.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Ok(value) => Some(value),
            Self::Failed(_) => None,
        }
    }
}

/// The assembled result of one workflow invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Unique id for this invocation; also the correlation id on every
    /// message it dispatched.
    pub workflow_id: String,
    /// Which named workflow ran.
    pub kind: WorkflowKind,
    /// Per-step outcomes, keyed by step name. Fan-out steps that never
    /// replied are omitted entirely.
    pub step_results: BTreeMap<String, StepResult>,
    /// Terminal state of the invocation.
    pub completion: WorkflowCompletion,
}

impl WorkflowResult {
    fn new(workflow_id: String, kind: WorkflowKind) -> Self {
        Self {
            workflow_id,
            kind,
            step_results: BTreeMap::new(),
            completion: WorkflowCompletion::Pending,
        }
    }

    /// Finalize the terminal state from how many of the expected steps
    /// reported.
    fn finalize(&mut self, replied: usize, expected: usize) {
        self.completion = if expected > 0 && replied == 0 {
            WorkflowCompletion::TimedOut
        } else if replied < expected {
            WorkflowCompletion::Partial
        } else {
            WorkflowCompletion::Completed
        };
    }
}

/// One fan-out branch: a step name, the channel to dispatch on, the
/// service expected to reply, and the request payload.
struct FanOutStep {
    step: &'static str,
    channel: &'static str,
    service: &'static str,
    payload: Value,
}

/// Drives named workflows over the broker and joins capability-service
/// replies.
///
/// Construct via [`Orchestrator::connect`], which installs the reply
/// route on the broker. `Clone`-free: share behind an `Arc`.
pub struct Orchestrator {
    broker: Arc<MessageBroker>,
    registry: Arc<ServiceRegistry>,
    reply_channel: String,
    timeout: Duration,
    /// Routes replies to the owning invocation by correlation id. An
    /// entry is removed when its workflow finalizes, so a late reply
    /// finds nothing and is discarded.
    pending: Arc<DashMap<String, mpsc::UnboundedSender<ServiceMessage>>>,
}

impl Orchestrator {
    /// Create an orchestrator and subscribe its reply route on the
    /// broker's reply channel.
    ///
    /// # Arguments
    ///
    /// * `reply_channel` - Channel capability services publish
    ///   `AI_RESPONSE` messages on.
    /// * `timeout` - Bounded wait applied to every join operation.
    pub async fn connect(
        broker: Arc<MessageBroker>,
        registry: Arc<ServiceRegistry>,
        reply_channel: impl Into<String>,
        timeout: Duration,
    ) -> Arc<Self> {
        let reply_channel = reply_channel.into();
        let pending: Arc<DashMap<String, mpsc::UnboundedSender<ServiceMessage>>> =
            Arc::new(DashMap::new());

        let route = pending.clone();
        let handler = Arc::new(FnHandler(move |message: ServiceMessage| {
            let route = route.clone();
            async move {
                let Some(correlation_id) = message.correlation_id.clone() else {
                    tracing::debug!(
                        message_id = %message.message_id,
                        "reply without correlation id discarded"
                    );
                    return Ok(());
                };
                match route.get(&correlation_id) {
                    Some(tx) => {
                        // A closed receiver means the workflow finalized
                        // between lookup and send; that is a late reply too.
                        let _ = tx.send(message);
                    }
                    None => {
                        tracing::debug!(
                            correlation_id = %correlation_id,
                            "late reply for finalized workflow discarded"
                        );
                    }
                }
                Ok(())
            }
        }));
        broker
            .subscribe(reply_channel.clone(), handler as Arc<dyn MessageHandler>)
            .await;

        Arc::new(Self {
            broker,
            registry,
            reply_channel,
            timeout,
            pending,
        })
    }

    /// Run a named workflow to completion (or its deadline).
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::BrokerStopped`] if the broker is not
    /// running. Asynchronous failures (a service not replying) are not
    /// errors; they degrade the result to `Partial` or `TimedOut`.
    pub async fn run_workflow(
        &self,
        kind: WorkflowKind,
        input: Value,
        user_id: &str,
    ) -> Result<WorkflowResult, WorkflowError> {
        if !self.broker.is_running() {
            return Err(WorkflowError::BrokerStopped);
        }

        let workflow_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(workflow_id.clone(), tx);

        tracing::info!(workflow_id = %workflow_id, kind = %kind, user_id, "workflow started");
        let deadline = Instant::now() + self.timeout;
        let mut result = WorkflowResult::new(workflow_id.clone(), kind);
        match kind {
            WorkflowKind::AdaptiveLearning => {
                self.run_adaptive_learning(&mut result, rx, deadline, &input, user_id)
                    .await;
            }
            WorkflowKind::MultimodalAnalysis => {
                let steps = multimodal_steps(&input, user_id);
                self.run_fan_out(&mut result, rx, deadline, steps).await;
            }
            WorkflowKind::CollaborativeLearning => {
                let steps = collaborative_steps(&input, user_id);
                self.run_fan_out(&mut result, rx, deadline, steps).await;
            }
        }

        // Untrack the invocation; replies arriving from here on are late
        // and get discarded by the reply route.
        self.pending.remove(&workflow_id);
        tracing::info!(
            workflow_id = %workflow_id,
            completion = ?result.completion,
            steps = result.step_results.len(),
            "workflow finalized"
        );
        Ok(result)
    }

    /// Sequential workflow: emotion analysis, then comprehension
    /// analysis, then the combined difficulty decision.
    ///
    /// A step that fails or times out degrades the decision to the
    /// conservative `"maintain"` default instead of aborting.
    async fn run_adaptive_learning(
        &self,
        result: &mut WorkflowResult,
        mut rx: mpsc::UnboundedReceiver<ServiceMessage>,
        deadline: Instant,
        input: &Value,
        user_id: &str,
    ) {
        let mut replied = 0usize;
        // Delivery is at-least-once: replies already seen, and replies
        // from a service other than the one the current step awaits,
        // must not be matched to the wrong step.
        let mut seen_replies = HashSet::new();

        let emotion = self
            .run_sequential_step(
                result,
                &mut rx,
                &mut seen_replies,
                deadline,
                "emotion_analysis",
                "ai.emotion",
                "emotion",
                json!({"user_id": user_id, "context": input}),
            )
            .await;
        if emotion.is_some() {
            replied += 1;
        }

        let comprehension = self
            .run_sequential_step(
                result,
                &mut rx,
                &mut seen_replies,
                deadline,
                "comprehension_analysis",
                "ai.nlp",
                "nlp",
                json!({"user_id": user_id, "context": input, "emotion": emotion}),
            )
            .await;
        if comprehension.is_some() {
            replied += 1;
        }

        let decision = difficulty_decision(emotion.as_ref(), comprehension.as_ref());
        result
            .step_results
            .insert("difficulty_decision".to_string(), StepResult::Ok(decision));
        result.finalize(replied, 2);
    }

    /// Dispatch one sequential step and await its reply within the shared
    /// deadline. Records the step outcome and returns the reply payload.
    ///
    /// Only a reply from the awaited service is accepted; redelivered
    /// replies (a `message_id` already in `seen_replies`) and replies
    /// from other services are discarded so they cannot be misattributed
    /// to this step.
    #[allow(clippy::too_many_arguments)]
    async fn run_sequential_step(
        &self,
        result: &mut WorkflowResult,
        rx: &mut mpsc::UnboundedReceiver<ServiceMessage>,
        seen_replies: &mut HashSet<Uuid>,
        deadline: Instant,
        step: &str,
        channel: &str,
        service: &str,
        payload: Value,
    ) -> Option<Value> {
        if !self.dispatch(channel, service, step, &result.workflow_id, payload) {
            result.step_results.insert(
                step.to_string(),
                StepResult::Failed("dispatch refused by broker".to_string()),
            );
            return None;
        }
        result.completion = WorkflowCompletion::AwaitingReplies;

        loop {
            let Some(reply) = await_reply(rx, deadline).await else {
                tracing::warn!(
                    workflow_id = %result.workflow_id,
                    step,
                    "sequential step produced no reply before the deadline"
                );
                result.step_results.insert(
                    step.to_string(),
                    StepResult::Failed("no reply within timeout".to_string()),
                );
                return None;
            };
            if !seen_replies.insert(reply.message_id) {
                tracing::debug!(
                    workflow_id = %result.workflow_id,
                    message_id = %reply.message_id,
                    "redelivered reply discarded"
                );
                continue;
            }
            if reply.source_service != service {
                tracing::debug!(
                    workflow_id = %result.workflow_id,
                    step,
                    source = %reply.source_service,
                    "reply from unexpected service ignored"
                );
                continue;
            }
            let payload = reply.payload;
            result
                .step_results
                .insert(step.to_string(), StepResult::Ok(payload.clone()));
            return Some(payload);
        }
    }

    /// Fan-out workflow: dispatch all steps in parallel, then join
    /// replies against one deadline. Steps that never reply are omitted
    /// from the result.
    async fn run_fan_out(
        &self,
        result: &mut WorkflowResult,
        mut rx: mpsc::UnboundedReceiver<ServiceMessage>,
        deadline: Instant,
        steps: Vec<FanOutStep>,
    ) {
        let mut awaiting: BTreeMap<&str, &str> = BTreeMap::new();
        for step in &steps {
            if self.dispatch(
                step.channel,
                step.service,
                step.step,
                &result.workflow_id,
                step.payload.clone(),
            ) {
                awaiting.insert(step.service, step.step);
            } else {
                result.step_results.insert(
                    step.step.to_string(),
                    StepResult::Failed("dispatch refused by broker".to_string()),
                );
            }
        }
        result.completion = WorkflowCompletion::AwaitingReplies;

        let expected = awaiting.len();
        let mut replied = 0usize;
        while !awaiting.is_empty() {
            let Some(reply) = await_reply(&mut rx, deadline).await else {
                // Deadline reached: whatever is still awaited is omitted.
                break;
            };
            match awaiting.remove(reply.source_service.as_str()) {
                Some(step) => {
                    replied += 1;
                    result
                        .step_results
                        .insert(step.to_string(), StepResult::Ok(reply.payload));
                }
                None => {
                    tracing::debug!(
                        workflow_id = %result.workflow_id,
                        source = %reply.source_service,
                        "reply from unexpected service ignored"
                    );
                }
            }
        }

        result.finalize(replied, expected);
    }

    /// Publish one `AI_REQUEST` carrying the workflow's correlation id
    /// and the orchestrator's reply channel.
    fn dispatch(
        &self,
        channel: &str,
        service: &str,
        step: &str,
        workflow_id: &str,
        payload: Value,
    ) -> bool {
        let message = ServiceMessage::new(MessageType::AiRequest, ORCHESTRATOR_SERVICE, payload)
            .with_target(service)
            .with_correlation_id(workflow_id)
            .with_reply_to(self.reply_channel.clone());
        tracing::debug!(workflow_id, step, channel, "dispatching step request");
        self.broker.publish(channel, message)
    }

    /// Snapshot capability-service health from the registry.
    ///
    /// Operational visibility only: workflows still dispatch to stale
    /// services and rely on timeouts, since staleness is advisory.
    pub async fn get_services_health(&self) -> BTreeMap<String, ServiceHealth> {
        self.registry.all().await
    }
}

/// Await the next reply, bounded by the invocation deadline.
async fn await_reply(
    rx: &mut mpsc::UnboundedReceiver<ServiceMessage>,
    deadline: Instant,
) -> Option<ServiceMessage> {
    match tokio::time::timeout_at(deadline, rx.recv()).await {
        Ok(Some(message)) => Some(message),
        // Elapsed, or the sender side was dropped.
        _ => None,
    }
}

/// Build the fan-out steps for `multimodal_analysis` from whichever
/// modalities are present in the input. Absent modalities get no step.
fn multimodal_steps(input: &Value, user_id: &str) -> Vec<FanOutStep> {
    let mut steps = Vec::new();
    if let Some(text) = input.get("text") {
        steps.push(FanOutStep {
            step: "text_analysis",
            channel: "ai.nlp",
            service: "nlp",
            payload: json!({"user_id": user_id, "text": text}),
        });
    }
    if let Some(image) = input.get("image") {
        steps.push(FanOutStep {
            step: "image_analysis",
            channel: "ai.vision",
            service: "vision",
            payload: json!({"user_id": user_id, "image": image}),
        });
    }
    if let Some(audio) = input.get("audio") {
        steps.push(FanOutStep {
            step: "audio_analysis",
            channel: "ai.speech",
            service: "speech",
            payload: json!({"user_id": user_id, "audio": audio}),
        });
    }
    steps
}

/// Build the fan-out steps for `collaborative_learning`.
fn collaborative_steps(input: &Value, user_id: &str) -> Vec<FanOutStep> {
    vec![
        FanOutStep {
            step: "peer_matching",
            channel: "ai.nlp",
            service: "nlp",
            payload: json!({"user_id": user_id, "goal": input.get("goal")}),
        },
        FanOutStep {
            step: "group_dynamics",
            channel: "ai.emotion",
            service: "emotion",
            payload: json!({"user_id": user_id, "group": input.get("group")}),
        },
    ]
}

/// Emotions that support raising the difficulty.
const CONFIDENT_EMOTIONS: &[&str] = &["engaged", "confident", "curious", "calm"];

/// Combine the two analysis steps into a difficulty-adjustment decision.
///
/// Missing inputs bias toward the conservative `"maintain"` default; the
/// decision never increases difficulty without comprehension evidence.
fn difficulty_decision(emotion: Option<&Value>, comprehension: Option<&Value>) -> Value {
    let emotion_name = emotion
        .and_then(|e| e.get("emotion"))
        .and_then(Value::as_str);
    let comprehension_score = comprehension
        .and_then(|c| c.get("comprehension"))
        .and_then(Value::as_f64);

    let mut degraded = Vec::new();
    if emotion.is_none() {
        degraded.push("emotion_analysis unavailable");
    }
    if comprehension.is_none() {
        degraded.push("comprehension_analysis unavailable");
    }

    let adjustment = match (emotion_name, comprehension_score) {
        (Some(emotion), Some(score)) if score >= 0.75 && CONFIDENT_EMOTIONS.contains(&emotion) => {
            "increase"
        }
        (Some("frustrated"), _) => "decrease",
        (_, Some(score)) if score < 0.4 => "decrease",
        _ => "maintain",
    };

    json!({
        "adjustment": adjustment,
        "emotion": emotion_name,
        "comprehension": comprehension_score,
        "degraded": degraded,
    })
}

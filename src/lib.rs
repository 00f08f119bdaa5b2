//! Event-sourced learning-state engine with workflow orchestration.
//!
//! The crate records immutable learning events in an append-only
//! [`EventStore`], folds them into per-learner [`LearnerProgress`]
//! projections, and coordinates capability services (emotion, nlp,
//! vision, speech) over an in-process [`MessageBroker`] through the
//! [`Orchestrator`]. The [`AdaptiveEngine`] ties the pieces together
//! behind the HTTP surface in [`server`].

mod adaptive;
mod broker;
mod config;
mod error;
mod event;
mod message;
mod orchestrator;
mod projection;
mod publisher;
mod registry;
mod store;

pub mod server;

pub use adaptive::{AdaptiveEngine, SkillProgressOutcome};
pub use broker::{FnHandler, MessageBroker, MessageHandler, SubscriptionId};
pub use config::EngineConfig;
pub use error::{AppendError, WorkflowError};
pub use event::{EventType, LearningEvent};
pub use message::{MessageType, ServiceMessage};
pub use orchestrator::{
    Orchestrator, StepResult, WorkflowCompletion, WorkflowKind, WorkflowResult,
};
pub use projection::{
    rebuild, rebuild_with_snapshot, DifficultyChange, LearnerAnalytics, LearnerProgress,
};
pub use publisher::{EventPublisher, EventSubscriber, SubscriberId};
pub use registry::{ServiceHealth, ServiceRegistry, ServiceStatus};
pub use store::{stream_uuid, AppendOutcome, EventStore, StateSnapshot};

//! Crate-level error types for append, dispatch, and workflow execution.

/// Error returned when appending an event to the store fails.
///
/// Duplicate event ids are **not** an error; they surface as
/// [`AppendOutcome::duplicate`](crate::store::AppendOutcome). Append can
/// only fail on journal persistence.
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// Disk I/O failure while writing the journal or a snapshot file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The event or snapshot could not be serialized to JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error returned when running a named workflow fails synchronously.
///
/// Asynchronous degradation (a capability service timing out or never
/// replying) is not an error: it is reported as a `Partial` or `TimedOut`
/// completion on the workflow result instead.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The caller asked for a workflow name the registry does not know.
    /// Surfaced immediately; never retried or silently defaulted.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// The message broker rejected the dispatch because it is stopped.
    #[error("message broker is not running")]
    BrokerStopped,

    /// Appending the workflow's follow-up event failed.
    #[error(transparent)]
    Append(#[from] AppendError),
}

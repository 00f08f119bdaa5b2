//! Engine configuration with documented defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Tunables for the engine, loaded once at startup.
///
/// All fields have sensible defaults accessible via
/// [`EngineConfig::default()`]; a JSON config file can override any
/// subset of them.
///
/// # Examples
///
/// ```
/// use learnloop::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.workflow_timeout_ms, 5_000);
/// assert_eq!(config.mastery_threshold, 0.8);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// A service with no heartbeat for longer than this is reported
    /// stale. Staleness is advisory; dispatch still happens.
    ///
    /// Default: 30 seconds.
    pub staleness_threshold_ms: u64,

    /// Bounded wait applied to every workflow join. On expiry the
    /// workflow finalizes with whatever step results arrived.
    ///
    /// Default: 5 seconds.
    pub workflow_timeout_ms: u64,

    /// Channel capability services publish replies on.
    ///
    /// Default: `"orchestrator.replies"`.
    pub reply_channel: String,

    /// Mastery score at or above which a skill counts as mastered and a
    /// difficulty increase is triggered.
    ///
    /// Default: 0.8.
    pub mastery_threshold: f64,

    /// Journal directory for the event store. `None` keeps the store
    /// in-memory only.
    ///
    /// Default: `None`.
    pub journal_dir: Option<PathBuf>,

    /// Address the HTTP server binds to.
    ///
    /// Default: `"127.0.0.1:8080"`.
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_ms: 30_000,
            workflow_timeout_ms: 5_000,
            reply_channel: "orchestrator.replies".to_string(),
            mastery_threshold: 0.8,
            journal_dir: None,
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the JSON file named by the
    /// `LEARNLOOP_CONFIG` environment variable, falling back to defaults
    /// when the variable is unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the named file cannot be read or parsed; a
    /// misconfigured deployment should fail loudly rather than run with
    /// silently-defaulted values.
    pub fn load() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        match std::env::var("LEARNLOOP_CONFIG") {
            Ok(path) => {
                let content = std::fs::read_to_string(&path)?;
                let config = serde_json::from_str(&content)?;
                tracing::info!(path, "configuration loaded");
                Ok(config)
            }
            Err(_) => Ok(Self::default()),
        }
    }

    /// Staleness threshold as a `Duration`.
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    /// Workflow join timeout as a `Duration`.
    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_millis(self.workflow_timeout_ms)
    }
}

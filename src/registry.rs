//! Heartbeat-based registry of capability services.
//!
//! Staleness is a pure function of time, recomputed on every read from
//! `now - last_heartbeat`; it is never cached as a flag that could go
//! out of date. Registrations are only removed by an explicit operator
//! call, never automatically.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Liveness of a registered service, derived at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Heartbeat seen within the staleness threshold.
    Active,
    /// No heartbeat for longer than the threshold. Advisory only: the
    /// orchestrator still dispatches to stale services and relies on
    /// timeouts.
    Stale,
    /// The service was never registered.
    Unknown,
}

/// One registered capability service.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    /// Declared capabilities (e.g. `"sentiment"`, `"object-detection"`).
    pub capabilities: Vec<String>,
    /// When the service first registered.
    pub registered_at: DateTime<Utc>,
    /// Monotonic time of the most recent heartbeat.
    pub last_heartbeat: Instant,
}

/// A read-time view of one registration, shaped for the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Declared capabilities.
    pub capabilities: Vec<String>,
    /// Status derived at snapshot time.
    pub status: ServiceStatus,
    /// Seconds since the last heartbeat.
    pub seconds_since_heartbeat: u64,
    /// When the service first registered.
    pub registered_at: DateTime<Utc>,
}

/// Tracks known capability services, their capabilities, and liveness.
///
/// Mutated only by `register`/`heartbeat`/`remove`; read by the
/// orchestrator for routing visibility. Writes hold the lock briefly so
/// frequent heartbeats do not starve readers.
#[derive(Debug)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceRegistration>>,
    staleness_threshold: Duration,
}

impl ServiceRegistry {
    /// Create a registry that marks a service stale after
    /// `staleness_threshold` without a heartbeat.
    pub fn new(staleness_threshold: Duration) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            staleness_threshold,
        }
    }

    /// Register a service, or refresh its capabilities and heartbeat if
    /// it is already known.
    pub async fn register(&self, name: impl Into<String>, capabilities: Vec<String>) {
        let name = name.into();
        let mut services = self.services.write().await;
        match services.get_mut(&name) {
            Some(existing) => {
                existing.capabilities = capabilities;
                existing.last_heartbeat = Instant::now();
                tracing::debug!(service = %name, "service re-registered");
            }
            None => {
                tracing::info!(service = %name, "service registered");
                services.insert(
                    name,
                    ServiceRegistration {
                        capabilities,
                        registered_at: Utc::now(),
                        last_heartbeat: Instant::now(),
                    },
                );
            }
        }
    }

    /// Record a heartbeat for a known service. Heartbeats from unknown
    /// services are logged and dropped; services must register first.
    pub async fn heartbeat(&self, name: &str) {
        let mut services = self.services.write().await;
        match services.get_mut(name) {
            Some(registration) => registration.last_heartbeat = Instant::now(),
            None => tracing::warn!(service = name, "heartbeat from unregistered service"),
        }
    }

    /// Derive the current status of a service.
    pub async fn status(&self, name: &str) -> ServiceStatus {
        let services = self.services.read().await;
        match services.get(name) {
            Some(registration) => self.derive_status(registration),
            None => ServiceStatus::Unknown,
        }
    }

    /// Snapshot all registrations with statuses derived at read time.
    pub async fn all(&self) -> BTreeMap<String, ServiceHealth> {
        let services = self.services.read().await;
        services
            .iter()
            .map(|(name, registration)| {
                (
                    name.clone(),
                    ServiceHealth {
                        capabilities: registration.capabilities.clone(),
                        status: self.derive_status(registration),
                        seconds_since_heartbeat: registration.last_heartbeat.elapsed().as_secs(),
                        registered_at: registration.registered_at,
                    },
                )
            })
            .collect()
    }

    /// Operator action: forget a service entirely.
    pub async fn remove(&self, name: &str) -> bool {
        let removed = self.services.write().await.remove(name).is_some();
        if removed {
            tracing::info!(service = name, "service removed by operator");
        }
        removed
    }

    fn derive_status(&self, registration: &ServiceRegistration) -> ServiceStatus {
        if registration.last_heartbeat.elapsed() > self.staleness_threshold {
            ServiceStatus::Stale
        } else {
            ServiceStatus::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_service_is_active() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry
            .register("nlp", vec!["sentiment".to_string()])
            .await;
        assert_eq!(registry.status("nlp").await, ServiceStatus::Active);
    }

    #[tokio::test]
    async fn unregistered_service_is_unknown() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        assert_eq!(registry.status("ghost").await, ServiceStatus::Unknown);
    }

    #[tokio::test]
    async fn staleness_is_recomputed_on_read_without_transition_call() {
        let registry = ServiceRegistry::new(Duration::from_millis(20));
        registry.register("vision", vec![]).await;

        assert_eq!(registry.status("vision").await, ServiceStatus::Active);
        tokio::time::sleep(Duration::from_millis(40)).await;
        // No state-transition call happened; the next read derives Stale
        // purely from elapsed time.
        assert_eq!(registry.status("vision").await, ServiceStatus::Stale);
    }

    #[tokio::test]
    async fn heartbeat_restores_active_status() {
        let registry = ServiceRegistry::new(Duration::from_millis(20));
        registry.register("speech", vec![]).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(registry.status("speech").await, ServiceStatus::Stale);

        registry.heartbeat("speech").await;
        assert_eq!(registry.status("speech").await, ServiceStatus::Active);
    }

    #[tokio::test]
    async fn stale_service_is_never_auto_deleted() {
        let registry = ServiceRegistry::new(Duration::from_millis(10));
        registry.register("emotion", vec![]).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let all = registry.all().await;
        assert!(all.contains_key("emotion"));
        assert_eq!(all["emotion"].status, ServiceStatus::Stale);

        assert!(registry.remove("emotion").await);
        assert_eq!(registry.status("emotion").await, ServiceStatus::Unknown);
    }

    #[tokio::test]
    async fn re_register_refreshes_capabilities() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry
            .register("nlp", vec!["sentiment".to_string()])
            .await;
        registry
            .register("nlp", vec!["sentiment".to_string(), "summarize".to_string()])
            .await;

        let all = registry.all().await;
        assert_eq!(all["nlp"].capabilities.len(), 2);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_service_is_a_noop() {
        let registry = ServiceRegistry::new(Duration::from_secs(30));
        registry.heartbeat("ghost").await;
        assert_eq!(registry.status("ghost").await, ServiceStatus::Unknown);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ServiceStatus::Stale).expect("serialization should succeed");
        assert_eq!(json, "\"stale\"");
    }
}

//! Health and readiness tracking
//!
//! Backs the agent's `/healthz` and `/readyz` endpoints. The pipeline's
//! readiness conditions are drained from their channel into this registry,
//! so the readiness probe reflects both "resources fetched" and "topology
//! updated".

use crate::conditions::{ConditionSink, ConditionUpdate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Latest observed state of one readiness condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionState {
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub last_update_timestamp: i64,
}

impl ConditionState {
    fn pending() -> Self {
        Self {
            status: false,
            reason: Some("no cycle completed yet".to_string()),
            last_update_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Overall health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub conditions: HashMap<String, ConditionState>,
}

/// Readiness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Registry of readiness conditions plus a startup gate.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    conditions: Arc<RwLock<HashMap<String, ConditionState>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a condition in its pending (not-yet-observed) state.
    pub async fn register(&self, name: &str) {
        let mut conditions = self.conditions.write().await;
        conditions.insert(name.to_string(), ConditionState::pending());
    }

    /// Apply a condition transition from the pipeline.
    pub async fn apply(&self, update: &ConditionUpdate) {
        let mut conditions = self.conditions.write().await;
        conditions.insert(
            update.condition.as_str().to_string(),
            ConditionState {
                status: update.status,
                reason: update.reason.clone(),
                last_update_timestamp: chrono::Utc::now().timestamp(),
            },
        );
    }

    /// Gate readiness on initialization being complete.
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let conditions = self.conditions.read().await.clone();
        // The process is healthy as long as it runs; individual condition
        // failures show up in readiness, not liveness.
        HealthResponse {
            healthy: true,
            conditions,
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("agent not yet initialized".to_string()),
            };
        }

        let conditions = self.conditions.read().await;
        let failed: Vec<&str> = conditions
            .iter()
            .filter(|(_, state)| !state.status)
            .map(|(name, _)| name.as_str())
            .collect();

        if failed.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("conditions not met: {}", failed.join(", "))),
            }
        }
    }
}

/// Drain condition updates into the registry until the sink side closes.
pub async fn run_condition_pump(
    registry: HealthRegistry,
    mut rx: mpsc::Receiver<ConditionUpdate>,
) {
    while let Some(update) = rx.recv().await {
        registry.apply(&update).await;
    }
}

/// Build the condition channel with a small buffer; reporters never block on
/// it (see [`crate::conditions::report`]).
pub fn condition_channel() -> (ConditionSink, mpsc::Receiver<ConditionUpdate>) {
    mpsc::channel(16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::ConditionType;

    #[tokio::test]
    async fn test_not_ready_before_initialization() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
    }

    #[tokio::test]
    async fn test_registered_conditions_gate_readiness() {
        let registry = HealthRegistry::new();
        registry
            .register(ConditionType::PodresourcesFetched.as_str())
            .await;
        registry.set_ready(true).await;

        // Pending condition keeps the agent not-ready.
        assert!(!registry.readiness().await.ready);

        registry
            .apply(&ConditionUpdate::ok(ConditionType::PodresourcesFetched))
            .await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_failed_condition_flips_readiness() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        registry
            .apply(&ConditionUpdate::ok(ConditionType::NodeTopologyUpdated))
            .await;
        assert!(registry.readiness().await.ready);

        registry
            .apply(&ConditionUpdate::failed(
                ConditionType::NodeTopologyUpdated,
                "update conflict",
            ))
            .await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.unwrap().contains("NodeTopologyUpdated"));
    }

    #[tokio::test]
    async fn test_condition_pump_applies_updates() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        let (tx, rx) = condition_channel();

        let pump = tokio::spawn(run_condition_pump(registry.clone(), rx));

        tx.send(ConditionUpdate::ok(ConditionType::PodresourcesFetched))
            .await
            .unwrap();
        drop(tx);
        pump.await.unwrap();

        let health = registry.health().await;
        assert!(health.conditions["PodresourcesFetched"].status);
    }

    #[tokio::test]
    async fn test_health_reports_conditions_without_flipping_liveness() {
        let registry = HealthRegistry::new();
        registry
            .apply(&ConditionUpdate::failed(
                ConditionType::PodresourcesFetched,
                "kubelet unreachable",
            ))
            .await;

        let health = registry.health().await;
        assert!(health.healthy);
        assert!(!health.conditions["PodresourcesFetched"].status);
    }
}

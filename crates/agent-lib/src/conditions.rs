//! Readiness-condition reporting
//!
//! The observer and the updater each report one condition over a shared
//! channel; an external consumer (in this repo, the health registry behind
//! `/readyz`) patches them into the pod's visible status. Reporting is
//! best-effort: a slow or missing consumer must never stall the pipeline.

use tokio::sync::mpsc;
use tracing::debug;

/// The two readiness conditions the pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    /// The last scan of the pod-resources endpoint succeeded.
    PodresourcesFetched,
    /// The last topology object reconciliation succeeded.
    NodeTopologyUpdated,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::PodresourcesFetched => "PodresourcesFetched",
            ConditionType::NodeTopologyUpdated => "NodeTopologyUpdated",
        }
    }
}

/// A single condition transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionUpdate {
    pub condition: ConditionType,
    pub status: bool,
    pub reason: Option<String>,
}

impl ConditionUpdate {
    pub fn ok(condition: ConditionType) -> Self {
        Self {
            condition,
            status: true,
            reason: None,
        }
    }

    pub fn failed(condition: ConditionType, reason: impl Into<String>) -> Self {
        Self {
            condition,
            status: false,
            reason: Some(reason.into()),
        }
    }
}

/// Sink for condition updates.
pub type ConditionSink = mpsc::Sender<ConditionUpdate>;

/// Report a condition without blocking; drops the update if the sink is full
/// or gone.
pub fn report(sink: &ConditionSink, update: ConditionUpdate) {
    if let Err(e) = sink.try_send(update) {
        debug!(error = %e, "Dropping readiness-condition update");
    }
}

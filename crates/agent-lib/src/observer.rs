//! Resource observer stage
//!
//! A single task consuming trigger events: each event runs one synchronous
//! scan-and-aggregate pass, so at most one scan is ever in flight. A failed
//! scan drops the event (the next trigger retries); a successful one emits a
//! MonitorInfo downstream and reports the "resources fetched" condition.

use crate::aggregator::{AggregatedTopology, NumaAggregator};
use crate::conditions::{self, ConditionSink, ConditionType, ConditionUpdate};
use crate::error::TopologyError;
use crate::models::{
    AttributeInfo, EventOrigin, MonitorInfo, TriggerEvent, ATTR_TOPOLOGY_MANAGER_POLICY,
    ATTR_TOPOLOGY_MANAGER_SCOPE,
};
use crate::observability;
use crate::scanner::ResourceScanner;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Observer configuration.
#[derive(Debug, Clone, Default)]
pub struct ObserverConfig {
    /// Re-query allocatable resources before every scan instead of trusting
    /// the startup snapshot.
    pub refresh_node_resources: bool,
    /// Kubelet topology-manager policy, published as an attribute.
    pub topology_manager_policy: Option<String>,
    /// Kubelet topology-manager scope, published as an attribute.
    pub topology_manager_scope: Option<String>,
}

/// The pipeline stage between the event source and the updater.
///
/// Owns the aggregator (and its capacity/allocatable cache) exclusively;
/// nothing else reads or writes it.
pub struct ResourceObserver<S: ResourceScanner> {
    scanner: S,
    aggregator: NumaAggregator,
    config: ObserverConfig,
    conditions: ConditionSink,
    last_wakeup: Option<Instant>,
}

impl<S: ResourceScanner> ResourceObserver<S> {
    pub fn new(
        scanner: S,
        aggregator: NumaAggregator,
        config: ObserverConfig,
        conditions: ConditionSink,
    ) -> Self {
        Self {
            scanner,
            aggregator,
            config,
            conditions,
            last_wakeup: None,
        }
    }

    /// Consume trigger events until the stream closes or shutdown is
    /// signalled. An in-flight scan always completes before a stop is
    /// honored.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<TriggerEvent>,
        info_tx: mpsc::Sender<MonitorInfo>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if !self.handle_event(event, &info_tx).await {
                                break;
                            }
                        }
                        None => {
                            debug!("Trigger event stream closed");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Resource observer stopped");
    }

    /// Returns false when the downstream channel is gone.
    async fn handle_event(
        &mut self,
        event: TriggerEvent,
        info_tx: &mpsc::Sender<MonitorInfo>,
    ) -> bool {
        let metrics = observability::metrics();

        let now = Instant::now();
        if let Some(last) = self.last_wakeup.replace(now) {
            metrics.observe_wakeup_interval(now.duration_since(last).as_secs_f64());
        }
        metrics.inc_events_received(event.origin.as_str());

        let start = Instant::now();
        match self.scan_once().await {
            Ok(result) => {
                metrics.observe_scan_latency(start.elapsed().as_secs_f64());
                conditions::report(
                    &self.conditions,
                    ConditionUpdate::ok(ConditionType::PodresourcesFetched),
                );

                let info = MonitorInfo {
                    timer: event.origin == EventOrigin::Periodic,
                    zones: result.zones,
                    attributes: self.attributes(),
                    annotations: result.annotations,
                };
                if info_tx.send(info).await.is_err() {
                    debug!("Monitor channel closed, stopping observer");
                    return false;
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "Scan failed, dropping trigger event");
                conditions::report(
                    &self.conditions,
                    ConditionUpdate::failed(
                        ConditionType::PodresourcesFetched,
                        e.to_string(),
                    ),
                );
                true
            }
        }
    }

    /// One scan cycle: list assignments, optionally refresh the allocatable
    /// tables, aggregate. The two upstream calls run sequentially; there is
    /// never a second scan concurrent with this one.
    async fn scan_once(&mut self) -> Result<AggregatedTopology, TopologyError> {
        let pods = self.scanner.scan().await?;

        if self.config.refresh_node_resources {
            let snapshot = self.scanner.get_allocatable().await?;
            self.aggregator.refresh_node_resources(&snapshot);
        }

        self.aggregator.aggregate(&pods)
    }

    fn attributes(&self) -> Vec<AttributeInfo> {
        let mut attributes = Vec::new();
        if let Some(policy) = &self.config.topology_manager_policy {
            attributes.push(AttributeInfo {
                name: ATTR_TOPOLOGY_MANAGER_POLICY.to_string(),
                value: policy.clone(),
            });
        }
        if let Some(scope) = &self.config.topology_manager_scope {
            attributes.push(AttributeInfo {
                name: ATTR_TOPOLOGY_MANAGER_SCOPE.to_string(),
                value: scope.clone(),
            });
        }
        attributes
    }
}

//! NUMA topology agent
//!
//! Runs as a DaemonSet on each node: watches for resource-allocation
//! changes, re-measures per-NUMA-zone capacity/allocatable/available, and
//! republishes the node's resource topology for the scheduler.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use topology_agent_lib::aggregator::{AggregatorConfig, NumaAggregator};
use topology_agent_lib::conditions::ConditionType;
use topology_agent_lib::events::{self, EventSource, FsEventSourceConfig};
use topology_agent_lib::health;
use topology_agent_lib::models::ResourceExcludeList;
use topology_agent_lib::observer::{ObserverConfig, ResourceObserver};
use topology_agent_lib::scanner::{PodResourcesScanner, ResourceScanner, ScannerConfig};
use topology_agent_lib::topology::MachineTopology;
use topology_agent_lib::updater::{
    node_owner_reference, DisconnectedStore, KubeTopologyStore, TopologyStore, Updater,
    UpdaterConfig,
};
use topology_agent_lib::{HealthRegistry, TopologyMetrics};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting topology-agent");

    let config = config::AgentConfig::load()?;
    info!(node_name = %config.node_name, "Agent configured");

    // Register metrics before any pipeline stage runs.
    let _metrics = TopologyMetrics::new();

    // Health registry fed by the pipeline's readiness conditions.
    let health_registry = HealthRegistry::new();
    health_registry
        .register(ConditionType::PodresourcesFetched.as_str())
        .await;
    health_registry
        .register(ConditionType::NodeTopologyUpdated.as_str())
        .await;

    let (cond_tx, cond_rx) = health::condition_channel();
    tokio::spawn(health::run_condition_pump(health_registry.clone(), cond_rx));

    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    tokio::spawn(api::serve(config.api_port, app_state));

    // Machine topology and the startup allocatable snapshot.
    let topology = MachineTopology::discover(&config.sysfs_root)
        .await
        .context("NUMA topology discovery failed")?;

    let mut scanner = PodResourcesScanner::connect(ScannerConfig {
        socket_path: config.podresources_socket.clone(),
        namespace: config.namespace.clone(),
        request_timeout: config.scan_timeout(),
    })
    .await
    .context("pod-resources endpoint unavailable")?;

    let mut aggregator = NumaAggregator::new(
        topology,
        AggregatorConfig {
            node_name: config.node_name.clone(),
            exclude_list: ResourceExcludeList(config.exclude_list.clone()),
            compute_pod_fingerprint: config.pods_fingerprint,
        },
    );
    let snapshot = scanner
        .get_allocatable()
        .await
        .context("initial allocatable-resources query failed")?;
    aggregator.refresh_node_resources(&snapshot);

    // Object store: a real cluster client unless publishing is disabled.
    let (store, owner_reference): (Box<dyn TopologyStore>, _) = if config.no_publish {
        info!("Publishing disabled, running without a cluster client");
        (Box::new(DisconnectedStore), None)
    } else {
        let client = kube::Client::try_default()
            .await
            .context("failed to create Kubernetes client")?;
        let owner = node_owner_reference(client.clone(), &config.node_name).await;
        (Box::new(KubeTopologyStore::new(client)), owner)
    };

    // Trigger source, optionally wrapped by the rate limiter.
    let mut source = events::make_event_source(
        FsEventSourceConfig {
            sleep_interval: config.sleep_interval(),
            notify_file: config.notify_file.clone(),
            kubelet_state_dirs: config.kubelet_state_dirs.clone(),
        },
        config.rate_limit(),
    );
    let events_rx = source.events().context("event stream unavailable")?;
    source.run().await.context("event source startup failed")?;

    // MonitorInfo channel: capacity one, so backpressure from the updater
    // blocks the observer rather than queueing stale measurements.
    let (info_tx, info_rx) = mpsc::channel(1);
    let (shutdown_tx, _) = broadcast::channel(1);

    let observer = ResourceObserver::new(
        scanner,
        aggregator,
        ObserverConfig {
            refresh_node_resources: config.refresh_node_resources,
            topology_manager_policy: config.topology_manager_policy.clone(),
            topology_manager_scope: config.topology_manager_scope.clone(),
        },
        cond_tx.clone(),
    );
    let observer_handle = tokio::spawn(observer.run(events_rx, info_tx, shutdown_tx.subscribe()));

    let updater = Updater::new(
        store,
        UpdaterConfig {
            node_name: config.node_name.clone(),
            no_publish: config.no_publish,
            one_shot: config.one_shot,
            owner_reference,
        },
        cond_tx,
    );
    let mut updater_handle = tokio::spawn(updater.run(info_rx, shutdown_tx.subscribe()));

    health_registry.set_ready(true).await;
    info!("Pipeline running");

    let mut updater_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
        _ = &mut updater_handle => {
            // One-shot mode: the updater returns after its single update.
            updater_done = true;
            info!("Updater finished, shutting down");
        }
    }

    // Teardown in pipeline order: the event source first (stop child before
    // parent inside the source chain), then the downstream stages.
    source.stop().await;
    source.wait().await;
    source.close();

    let _ = shutdown_tx.send(());
    let _ = observer_handle.await;
    if !updater_done {
        let _ = updater_handle.await;
    }

    info!("Shutdown complete");
    Ok(())
}

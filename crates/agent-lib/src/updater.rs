//! Topology object reconciliation
//!
//! Consumes MonitorInfo messages and reconciles each into the cluster's
//! NodeResourceTopology object for this node: get-by-name, then create when
//! absent or update when present. Errors are reported through the readiness
//! condition and not retried inline; the next trigger cycle retries
//! implicitly. Conflict handling relies on the store's optimistic
//! concurrency, nothing more.

use crate::conditions::{self, ConditionSink, ConditionType, ConditionUpdate};
use crate::error::TopologyError;
use crate::models::{AttributeInfo, MonitorInfo, Zone, ATTR_TOPOLOGY_MANAGER_POLICY};
use crate::observability;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, PostParams};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Annotation recording why the object was last rewritten: `periodic` for a
/// timer-driven cycle, `reactive` for a filesystem-driven one.
pub const UPDATE_REASON_ANNOTATION: &str = "topology.node.k8s.io/rte-update";

/// Cluster-scoped object publishing this node's NUMA resource topology,
/// keyed by node name.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "topology.node.k8s.io",
    version = "v1alpha2",
    kind = "NodeResourceTopology",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeResourceTopologySpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<Zone>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<AttributeInfo>,
    /// Deprecated upstream summary of the topology-manager policy, kept for
    /// consumers that still read it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_policies: Vec<String>,
}

/// Narrow get/create/update contract over the object store. Concurrent
/// modification is handled by the store's optimistic concurrency semantics.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<NodeResourceTopology>, TopologyError>;

    async fn create(&self, obj: &NodeResourceTopology) -> Result<(), TopologyError>;

    async fn update(&self, obj: &NodeResourceTopology) -> Result<(), TopologyError>;
}

#[async_trait]
impl TopologyStore for Box<dyn TopologyStore> {
    async fn get(&self, name: &str) -> Result<Option<NodeResourceTopology>, TopologyError> {
        (**self).get(name).await
    }

    async fn create(&self, obj: &NodeResourceTopology) -> Result<(), TopologyError> {
        (**self).create(obj).await
    }

    async fn update(&self, obj: &NodeResourceTopology) -> Result<(), TopologyError> {
        (**self).update(obj).await
    }
}

/// Store used with no-publish mode, where no cluster credentials exist. The
/// updater short-circuits before any store call, so reaching one is a bug.
pub struct DisconnectedStore;

#[async_trait]
impl TopologyStore for DisconnectedStore {
    async fn get(&self, _name: &str) -> Result<Option<NodeResourceTopology>, TopologyError> {
        Err(TopologyError::Store {
            op: "get",
            message: "publishing is disabled".to_string(),
        })
    }

    async fn create(&self, _obj: &NodeResourceTopology) -> Result<(), TopologyError> {
        Err(TopologyError::Store {
            op: "create",
            message: "publishing is disabled".to_string(),
        })
    }

    async fn update(&self, _obj: &NodeResourceTopology) -> Result<(), TopologyError> {
        Err(TopologyError::Store {
            op: "update",
            message: "publishing is disabled".to_string(),
        })
    }
}

/// Kubernetes-backed store.
pub struct KubeTopologyStore {
    api: Api<NodeResourceTopology>,
}

impl KubeTopologyStore {
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl TopologyStore for KubeTopologyStore {
    async fn get(&self, name: &str) -> Result<Option<NodeResourceTopology>, TopologyError> {
        match self.api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(TopologyError::Store {
                op: "get",
                message: e.to_string(),
            }),
        }
    }

    async fn create(&self, obj: &NodeResourceTopology) -> Result<(), TopologyError> {
        self.api
            .create(&PostParams::default(), obj)
            .await
            .map(|_| ())
            .map_err(|e| TopologyError::Store {
                op: "create",
                message: e.to_string(),
            })
    }

    async fn update(&self, obj: &NodeResourceTopology) -> Result<(), TopologyError> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.api
            .replace(&name, &PostParams::default(), obj)
            .await
            .map(|_| ())
            .map_err(|e| TopologyError::Store {
                op: "update",
                message: e.to_string(),
            })
    }
}

/// Owner reference pointing at this agent's Node, so the published object is
/// garbage-collected with it. Publishing works without one, so a lookup
/// failure only logs.
pub async fn node_owner_reference(
    client: kube::Client,
    node_name: &str,
) -> Option<OwnerReference> {
    let nodes: Api<k8s_openapi::api::core::v1::Node> = Api::all(client);
    match nodes.get(node_name).await {
        Ok(node) => Some(OwnerReference {
            api_version: "v1".to_string(),
            kind: "Node".to_string(),
            name: node_name.to_string(),
            uid: node.metadata.uid.unwrap_or_default(),
            ..Default::default()
        }),
        Err(e) => {
            warn!(node = %node_name, error = %e, "Could not resolve node for owner reference");
            None
        }
    }
}

/// Updater configuration.
#[derive(Debug, Clone, Default)]
pub struct UpdaterConfig {
    pub node_name: String,
    /// Skip all store calls; cycles still count as successful.
    pub no_publish: bool,
    /// Process exactly one MonitorInfo, then return.
    pub one_shot: bool,
    pub owner_reference: Option<OwnerReference>,
}

/// The final pipeline stage.
pub struct Updater<S: TopologyStore> {
    store: S,
    config: UpdaterConfig,
    conditions: ConditionSink,
}

impl<S: TopologyStore> Updater<S> {
    pub fn new(store: S, config: UpdaterConfig, conditions: ConditionSink) -> Self {
        Self {
            store,
            config,
            conditions,
        }
    }

    /// Consume MonitorInfo messages in production order until the channel
    /// closes or shutdown is signalled. In one-shot mode, return after the
    /// first message.
    pub async fn run(
        self,
        mut info_rx: mpsc::Receiver<MonitorInfo>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                maybe_info = info_rx.recv() => {
                    match maybe_info {
                        Some(info) => {
                            self.process(&info).await;
                            if self.config.one_shot {
                                info!("One-shot update complete, stopping updater");
                                return;
                            }
                        }
                        None => {
                            debug!("Monitor channel closed");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Updater stopped");
    }

    async fn process(&self, info: &MonitorInfo) {
        match self.publish(info).await {
            Ok(()) => {
                observability::metrics().inc_topology_updates(info.update_reason());
                conditions::report(
                    &self.conditions,
                    ConditionUpdate::ok(ConditionType::NodeTopologyUpdated),
                );
            }
            Err(e) => {
                observability::metrics().inc_update_errors();
                warn!(error = %e, "Failed to reconcile topology object");
                conditions::report(
                    &self.conditions,
                    ConditionUpdate::failed(ConditionType::NodeTopologyUpdated, e.to_string()),
                );
            }
        }
    }

    /// One reconciliation cycle: get, then create or update.
    pub async fn publish(&self, info: &MonitorInfo) -> Result<(), TopologyError> {
        if self.config.no_publish {
            debug!("Publishing disabled, skipping topology update");
            return Ok(());
        }

        match self.store.get(&self.config.node_name).await? {
            None => {
                let mut obj = NodeResourceTopology::new(
                    &self.config.node_name,
                    NodeResourceTopologySpec::default(),
                );
                self.apply(&mut obj, info);
                debug!(node = %self.config.node_name, "Creating topology object");
                self.store.create(&obj).await
            }
            Some(existing) => {
                let mut obj = existing.clone();
                self.apply(&mut obj, info);
                debug!(node = %self.config.node_name, "Updating topology object");
                self.store.update(&obj).await
            }
        }
    }

    fn apply(&self, obj: &mut NodeResourceTopology, info: &MonitorInfo) {
        let annotations = obj.metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(
            UPDATE_REASON_ANNOTATION.to_string(),
            info.update_reason().to_string(),
        );
        for (key, value) in &info.annotations {
            annotations.insert(key.clone(), value.clone());
        }

        if let Some(owner) = &self.config.owner_reference {
            obj.metadata.owner_references = Some(vec![owner.clone()]);
        }

        obj.spec.zones = info.zones.clone();
        obj.spec.attributes = info.attributes.clone();
        obj.spec.topology_policies = info
            .attributes
            .iter()
            .find(|a| a.name == ATTR_TOPOLOGY_MANAGER_POLICY)
            .map(|a| vec![a.value.clone()])
            .unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CostInfo, ResourceInfo, ZONE_TYPE_NODE};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::timeout;

    /// In-memory store counting calls.
    #[derive(Default)]
    struct FakeStore {
        objects: Mutex<HashMap<String, NodeResourceTopology>>,
        creates: AtomicUsize,
        updates: AtomicUsize,
    }

    #[async_trait]
    impl TopologyStore for Arc<FakeStore> {
        async fn get(
            &self,
            name: &str,
        ) -> Result<Option<NodeResourceTopology>, TopologyError> {
            Ok(self.objects.lock().unwrap().get(name).cloned())
        }

        async fn create(&self, obj: &NodeResourceTopology) -> Result<(), TopologyError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let name = obj.metadata.name.clone().unwrap_or_default();
            self.objects.lock().unwrap().insert(name, obj.clone());
            Ok(())
        }

        async fn update(&self, obj: &NodeResourceTopology) -> Result<(), TopologyError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            let name = obj.metadata.name.clone().unwrap_or_default();
            self.objects.lock().unwrap().insert(name, obj.clone());
            Ok(())
        }
    }

    fn monitor_info(timer: bool) -> MonitorInfo {
        MonitorInfo {
            timer,
            zones: vec![Zone {
                name: "node-0".to_string(),
                zone_type: ZONE_TYPE_NODE.to_string(),
                costs: vec![CostInfo {
                    name: "node-0".to_string(),
                    value: 10,
                }],
                resources: vec![ResourceInfo {
                    name: "cpu".to_string(),
                    capacity: 12,
                    allocatable: 12,
                    available: 10,
                }],
            }],
            attributes: vec![AttributeInfo {
                name: ATTR_TOPOLOGY_MANAGER_POLICY.to_string(),
                value: "single-numa-node".to_string(),
            }],
            annotations: BTreeMap::new(),
        }
    }

    fn updater(store: Arc<FakeStore>, config: UpdaterConfig) -> Updater<Arc<FakeStore>> {
        let (cond_tx, _cond_rx) = mpsc::channel(16);
        Updater::new(store, config, cond_tx)
    }

    fn config(node: &str) -> UpdaterConfig {
        UpdaterConfig {
            node_name: node.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_publish_creates_when_absent() {
        let store = Arc::new(FakeStore::default());
        let updater = updater(store.clone(), config("worker-1"));

        updater.publish(&monitor_info(true)).await.unwrap();

        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(store.updates.load(Ordering::SeqCst), 0);

        let obj = store.objects.lock().unwrap()["worker-1"].clone();
        assert_eq!(
            obj.metadata.annotations.unwrap()[UPDATE_REASON_ANNOTATION],
            "periodic"
        );
        assert_eq!(obj.spec.zones.len(), 1);
        assert_eq!(obj.spec.topology_policies, vec!["single-numa-node"]);
    }

    #[tokio::test]
    async fn test_publish_updates_when_present() {
        let store = Arc::new(FakeStore::default());
        let updater = updater(store.clone(), config("worker-1"));

        updater.publish(&monitor_info(true)).await.unwrap();
        updater.publish(&monitor_info(false)).await.unwrap();

        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(store.updates.load(Ordering::SeqCst), 1);

        let obj = store.objects.lock().unwrap()["worker-1"].clone();
        assert_eq!(
            obj.metadata.annotations.unwrap()[UPDATE_REASON_ANNOTATION],
            "reactive"
        );
    }

    #[tokio::test]
    async fn test_no_publish_is_a_successful_noop() {
        let store = Arc::new(FakeStore::default());
        let updater = updater(
            store.clone(),
            UpdaterConfig {
                node_name: "worker-1".to_string(),
                no_publish: true,
                ..Default::default()
            },
        );

        updater.publish(&monitor_info(true)).await.unwrap();

        assert_eq!(store.creates.load(Ordering::SeqCst), 0);
        assert_eq!(store.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_monitor_annotations_are_merged() {
        let store = Arc::new(FakeStore::default());
        let updater = updater(store.clone(), config("worker-1"));

        let mut info = monitor_info(true);
        info.annotations.insert(
            "topology.node.k8s.io/podset-fingerprint".to_string(),
            "pfp0v001abc".to_string(),
        );
        updater.publish(&info).await.unwrap();

        let obj = store.objects.lock().unwrap()["worker-1"].clone();
        let annotations = obj.metadata.annotations.unwrap();
        assert_eq!(
            annotations["topology.node.k8s.io/podset-fingerprint"],
            "pfp0v001abc"
        );
    }

    #[tokio::test]
    async fn test_owner_reference_is_attached() {
        let store = Arc::new(FakeStore::default());
        let updater = updater(
            store.clone(),
            UpdaterConfig {
                node_name: "worker-1".to_string(),
                owner_reference: Some(OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "Node".to_string(),
                    name: "worker-1".to_string(),
                    uid: "abc-123".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        updater.publish(&monitor_info(true)).await.unwrap();

        let obj = store.objects.lock().unwrap()["worker-1"].clone();
        let owners = obj.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Node");
    }

    #[tokio::test]
    async fn test_one_shot_processes_exactly_one_message() {
        // A `break` inside the select arm would only exit the select and
        // loop again; one-shot must return from the loop itself. This pins
        // the semantics: exactly one MonitorInfo is processed.
        let store = Arc::new(FakeStore::default());
        let updater = updater(
            store.clone(),
            UpdaterConfig {
                node_name: "worker-1".to_string(),
                one_shot: true,
                ..Default::default()
            },
        );

        let (info_tx, info_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        info_tx.send(monitor_info(true)).await.unwrap();
        info_tx.send(monitor_info(false)).await.unwrap();

        timeout(Duration::from_secs(5), updater.run(info_rx, shutdown_rx))
            .await
            .expect("one-shot updater did not stop after one message");

        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(store.updates.load(Ordering::SeqCst), 0);
    }
}

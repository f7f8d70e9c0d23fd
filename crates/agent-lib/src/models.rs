//! Core data model for the topology agent
//!
//! The zone/resource/cost shapes here are what ends up in the published
//! NodeResourceTopology object, so they serialize with the external API's
//! field casing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Zone type tag for NUMA nodes. The only zone type this agent produces.
pub const ZONE_TYPE_NODE: &str = "Node";

/// Attribute names for the kubelet topology-manager configuration.
pub const ATTR_TOPOLOGY_MANAGER_POLICY: &str = "topologyManagerPolicy";
pub const ATTR_TOPOLOGY_MANAGER_SCOPE: &str = "topologyManagerScope";

/// One NUMA node's resource accounting unit.
///
/// Every NUMA node known to the machine topology gets exactly one Zone in the
/// published output, even when nothing is allocatable there. A scheduler
/// infers "zone does not exist" from absence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub name: String,
    #[serde(rename = "type")]
    pub zone_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub costs: Vec<CostInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceInfo>,
}

/// Per-zone accounting for a single resource name.
///
/// CPU and discrete devices are counted in units; `memory` and `hugepages-*`
/// resources are counted in bytes. `available <= allocatable <= capacity` is
/// the intended ordering but is restored by clamping and backfill rather than
/// assumed from the inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub name: String,
    pub capacity: u64,
    pub allocatable: u64,
    pub available: u64,
}

/// Distance from the owning zone to `name`, including the self entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostInfo {
    pub name: String,
    pub value: u64,
}

/// Free-form (name, value) attribute attached to the published object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeInfo {
    pub name: String,
    pub value: String,
}

/// Derived name for a NUMA zone, stable across scans.
pub fn zone_name(numa_id: u64) -> String {
    format!("node-{numa_id}")
}

/// True for resources accounted in bytes rather than unit counts.
pub fn is_memory_resource(name: &str) -> bool {
    name == "memory" || name.starts_with("hugepages-")
}

/// Per-node or global set of resource names to omit from published zones.
///
/// The literal `*` key matches every node. Exclusion applies only at
/// zone-assembly time; internal capacity/allocatable bookkeeping is never
/// filtered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceExcludeList(pub HashMap<String, Vec<String>>);

impl ResourceExcludeList {
    /// Resource names excluded for `node_name`, merging the wildcard entry.
    pub fn for_node(&self, node_name: &str) -> HashSet<String> {
        let mut excluded = HashSet::new();
        for key in ["*", node_name] {
            if let Some(names) = self.0.get(key) {
                excluded.extend(names.iter().cloned());
            }
        }
        excluded
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Where a trigger event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Fixed-interval timer tick.
    Periodic,
    /// Observed filesystem change (notify file, kubelet state dir).
    FsNotify,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Periodic => "periodic",
            EventOrigin::FsNotify => "fsnotify",
        }
    }
}

/// A single re-measure trigger. Produced by the event source, consumed
/// exactly once by the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    pub timestamp: DateTime<Utc>,
    pub origin: EventOrigin,
}

impl TriggerEvent {
    pub fn now(origin: EventOrigin) -> Self {
        Self {
            timestamp: Utc::now(),
            origin,
        }
    }
}

/// Message passed from the observer to the updater after a successful scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorInfo {
    /// True when the scan was triggered by the periodic timer, false for a
    /// reactive (filesystem) trigger.
    pub timer: bool,
    pub zones: Vec<Zone>,
    pub attributes: Vec<AttributeInfo>,
    pub annotations: BTreeMap<String, String>,
}

impl MonitorInfo {
    /// Update provenance recorded on the published object. Derived purely
    /// from the trigger origin, never from wall-clock heuristics.
    pub fn update_reason(&self) -> &'static str {
        if self.timer {
            "periodic"
        } else {
            "reactive"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_name() {
        assert_eq!(zone_name(0), "node-0");
        assert_eq!(zone_name(17), "node-17");
    }

    #[test]
    fn test_is_memory_resource() {
        assert!(is_memory_resource("memory"));
        assert!(is_memory_resource("hugepages-2Mi"));
        assert!(is_memory_resource("hugepages-1Gi"));
        assert!(!is_memory_resource("cpu"));
        assert!(!is_memory_resource("vendor.io/device"));
    }

    #[test]
    fn test_exclude_list_wildcard_and_node() {
        let mut map = HashMap::new();
        map.insert("*".to_string(), vec!["fake.io/x".to_string()]);
        map.insert("worker-1".to_string(), vec!["vendor.io/gpu".to_string()]);
        let list = ResourceExcludeList(map);

        let worker1 = list.for_node("worker-1");
        assert!(worker1.contains("fake.io/x"));
        assert!(worker1.contains("vendor.io/gpu"));

        let worker2 = list.for_node("worker-2");
        assert!(worker2.contains("fake.io/x"));
        assert!(!worker2.contains("vendor.io/gpu"));
    }

    #[test]
    fn test_update_reason() {
        let info = MonitorInfo {
            timer: true,
            zones: Vec::new(),
            attributes: Vec::new(),
            annotations: BTreeMap::new(),
        };
        assert_eq!(info.update_reason(), "periodic");

        let info = MonitorInfo { timer: false, ..info };
        assert_eq!(info.update_reason(), "reactive");
    }

    #[test]
    fn test_zone_serializes_with_api_casing() {
        let zone = Zone {
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
        };

        let json = serde_json::to_value(&zone).unwrap();
        assert_eq!(json["type"], "Node");
        assert_eq!(json["resources"][0]["allocatable"], 12);
    }
}

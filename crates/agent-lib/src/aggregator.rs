//! NUMA-aware resource aggregation
//!
//! Combines the machine's NUMA layout with the kubelet's allocatable
//! snapshot and the current per-pod assignments to produce per-zone
//! capacity/allocatable/available counters. The aggregator's job is to
//! always emit a usable, bounded record even from imperfect inputs: data
//! anomalies are clamped or backfilled with a warning, never fatal. Only a
//! missing distance vector aborts a scan cycle, because schedulers depend on
//! complete adjacency.

use crate::error::TopologyError;
use crate::fingerprint::{self, FINGERPRINT_ANNOTATION};
use crate::models::{
    zone_name, CostInfo, ResourceExcludeList, ResourceInfo, Zone, ZONE_TYPE_NODE,
};
use crate::proto::v1::{
    AllocatableResourcesResponse, ContainerDevices, ContainerMemory, PodResources,
};
use crate::topology::{MachineTopology, NumaZoneInfo};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// Resource name used for logical CPUs.
pub const RESOURCE_CPU: &str = "cpu";

/// Per-zone, per-resource counters. BTreeMaps keep the published output
/// deterministic across scans.
type ZoneResources = BTreeMap<u64, BTreeMap<String, u64>>;

/// Aggregator configuration, resolved once at construction.
#[derive(Debug, Clone, Default)]
pub struct AggregatorConfig {
    /// This node's name; selects the applicable exclude-list entries.
    pub node_name: String,
    pub exclude_list: ResourceExcludeList,
    /// Attach the pod-set fingerprint annotation to every result.
    pub compute_pod_fingerprint: bool,
}

/// Output of one aggregation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedTopology {
    pub zones: Vec<Zone>,
    pub annotations: BTreeMap<String, String>,
}

/// NUMA resource aggregator.
///
/// The capacity/allocatable cache is owned by the observer's task and
/// mutated only through [`refresh_node_resources`]; the single-caller
/// discipline makes locking unnecessary.
///
/// [`refresh_node_resources`]: NumaAggregator::refresh_node_resources
pub struct NumaAggregator {
    topology: MachineTopology,
    excluded: HashSet<String>,
    compute_pod_fingerprint: bool,
    node_capacity: ZoneResources,
    node_allocatable: ZoneResources,
}

impl NumaAggregator {
    pub fn new(topology: MachineTopology, config: AggregatorConfig) -> Self {
        Self {
            excluded: config.exclude_list.for_node(&config.node_name),
            compute_pod_fingerprint: config.compute_pod_fingerprint,
            topology,
            node_capacity: ZoneResources::new(),
            node_allocatable: ZoneResources::new(),
        }
    }

    /// Recompute the capacity and allocatable tables from an allocatable
    /// snapshot. Called once at startup, or before every scan when refresh
    /// is enabled.
    ///
    /// CPU capacity comes from the machine topology; everything else is
    /// normalized from the snapshot. Capacity and allocatable are kept
    /// logically independent so they may diverge (hardware disabled at BIOS
    /// level but visible to the kernel).
    pub fn refresh_node_resources(&mut self, snapshot: &AllocatableResourcesResponse) {
        let mut capacity = self.normalize_snapshot(snapshot);
        for zone in &self.topology.zones {
            if !zone.cpus.is_empty() {
                capacity
                    .entry(zone.id)
                    .or_default()
                    .insert(RESOURCE_CPU.to_string(), zone.cpus.len() as u64);
            }
        }

        self.node_capacity = capacity;
        self.node_allocatable = self.normalize_snapshot(snapshot);
        debug!(
            zones = self.node_allocatable.len(),
            "Refreshed node capacity and allocatable tables"
        );
    }

    /// Turn the current per-pod assignments into per-zone counters and
    /// assemble the published zone list.
    pub fn aggregate(
        &self,
        pods: &[PodResources],
    ) -> Result<AggregatedTopology, TopologyError> {
        let used = self.normalize_pods(pods);

        let mut zones = Vec::with_capacity(self.topology.zones.len());
        for zone_info in &self.topology.zones {
            let costs = self.zone_costs(zone_info)?;
            let mut resources = self.zone_resources(zone_info, &used);

            // Exclusion applies to the published output only; the internal
            // tables are untouched.
            resources.retain(|r| !self.excluded.contains(&r.name));

            zones.push(Zone {
                name: zone_name(zone_info.id),
                zone_type: ZONE_TYPE_NODE.to_string(),
                costs,
                resources,
            });
        }

        let mut annotations = BTreeMap::new();
        if self.compute_pod_fingerprint {
            let pairs: Vec<(String, String)> = pods
                .iter()
                .map(|p| (p.namespace.clone(), p.name.clone()))
                .collect();
            annotations.insert(
                FINGERPRINT_ANNOTATION.to_string(),
                fingerprint::compute(&pairs),
            );
        }

        Ok(AggregatedTopology { zones, annotations })
    }

    fn zone_resources(
        &self,
        zone_info: &NumaZoneInfo,
        used: &ZoneResources,
    ) -> Vec<ResourceInfo> {
        let allocatable = match self.node_allocatable.get(&zone_info.id) {
            Some(map) if !map.is_empty() => map,
            _ => {
                // A zone with nothing allocatable still appears, its CPUs
                // fully reserved. Absence would read as "zone does not
                // exist" downstream.
                return vec![ResourceInfo {
                    name: RESOURCE_CPU.to_string(),
                    capacity: zone_info.cpus.len() as u64,
                    allocatable: 0,
                    available: 0,
                }];
            }
        };

        let zone = zone_name(zone_info.id);
        let mut resources = Vec::with_capacity(allocatable.len());
        for (name, &alloc) in allocatable {
            let used_amount = used
                .get(&zone_info.id)
                .and_then(|m| m.get(name))
                .copied()
                .unwrap_or(0);

            let available = if used_amount > alloc {
                warn!(
                    zone = %zone,
                    resource = %name,
                    used = used_amount,
                    allocatable = alloc,
                    "Observed usage exceeds allocatable, clamping available to zero"
                );
                0
            } else {
                alloc - used_amount
            };

            let known_capacity = self
                .node_capacity
                .get(&zone_info.id)
                .and_then(|m| m.get(name))
                .copied()
                .unwrap_or(0);
            let floor = alloc.max(used_amount);
            let capacity = if known_capacity < floor {
                warn!(
                    zone = %zone,
                    resource = %name,
                    capacity = known_capacity,
                    backfill = floor,
                    "Capacity below observed bounds, backfilling"
                );
                floor
            } else {
                known_capacity
            };

            resources.push(ResourceInfo {
                name: name.clone(),
                capacity,
                allocatable: alloc,
                available,
            });
        }

        resources
    }

    /// Cost list for one zone: the distance to every known zone including
    /// self, copied verbatim from the topology's distance vector.
    fn zone_costs(&self, zone_info: &NumaZoneInfo) -> Result<Vec<CostInfo>, TopologyError> {
        let mut costs = Vec::with_capacity(self.topology.zones.len());
        for (idx, dest) in self.topology.zones.iter().enumerate() {
            let value = zone_info.distances.get(idx).copied().ok_or_else(|| {
                TopologyError::MissingDistance {
                    zone: zone_name(zone_info.id),
                    dest: zone_name(dest.id),
                }
            })?;
            costs.push(CostInfo {
                name: zone_name(dest.id),
                value,
            });
        }
        Ok(costs)
    }

    /// Normalize an allocatable snapshot into per-zone counters.
    fn normalize_snapshot(&self, snapshot: &AllocatableResourcesResponse) -> ZoneResources {
        let mut out = ZoneResources::new();
        for device in &snapshot.devices {
            self.add_device(&mut out, device);
        }
        self.add_cpus(&mut out, &snapshot.cpu_ids);
        for memory in &snapshot.memory {
            self.add_memory(&mut out, memory);
        }
        out
    }

    /// Normalize current per-pod assignments into per-zone counters, with
    /// the same attribution rules as the snapshot.
    fn normalize_pods(&self, pods: &[PodResources]) -> ZoneResources {
        let mut out = ZoneResources::new();
        for pod in pods {
            for container in &pod.containers {
                for device in &container.devices {
                    self.add_device(&mut out, device);
                }
                self.add_cpus(&mut out, &container.cpu_ids);
                for memory in &container.memory {
                    self.add_memory(&mut out, memory);
                }
            }
        }
        out
    }

    /// Devices count one unit per device id, attributed to each hinted NUMA
    /// node. A device without hints is not attributed to any zone: its
    /// locality is unknown, and guessing would be worse than omitting.
    fn add_device(&self, out: &mut ZoneResources, device: &ContainerDevices) {
        let nodes = device
            .topology
            .as_ref()
            .map(|t| t.nodes.as_slice())
            .unwrap_or_default();
        if nodes.is_empty() {
            debug!(
                resource = %device.resource_name,
                devices = device.device_ids.len(),
                "Device has no NUMA hints, not attributed to any zone"
            );
            return;
        }

        for node in nodes {
            let Ok(zone_id) = u64::try_from(node.id) else {
                continue;
            };
            *out.entry(zone_id)
                .or_default()
                .entry(device.resource_name.clone())
                .or_insert(0) += device.device_ids.len() as u64;
        }
    }

    /// Memory-type resources contribute their byte size, never a block
    /// count.
    fn add_memory(&self, out: &mut ZoneResources, memory: &ContainerMemory) {
        let nodes = memory
            .topology
            .as_ref()
            .map(|t| t.nodes.as_slice())
            .unwrap_or_default();
        for node in nodes {
            let Ok(zone_id) = u64::try_from(node.id) else {
                continue;
            };
            *out.entry(zone_id)
                .or_default()
                .entry(memory.memory_type.clone())
                .or_insert(0) += memory.size;
        }
    }

    fn add_cpus(&self, out: &mut ZoneResources, cpu_ids: &[i64]) {
        for &cpu in cpu_ids {
            let zone = u64::try_from(cpu)
                .ok()
                .and_then(|id| self.topology.zone_for_cpu(id));
            match zone {
                Some(zone_id) => {
                    *out.entry(zone_id)
                        .or_default()
                        .entry(RESOURCE_CPU.to_string())
                        .or_insert(0) += 1;
                }
                None => debug!(cpu, "CPU not present in machine topology, skipping"),
            }
        }
    }
}

//! NUMA machine topology discovery
//!
//! Reads the kernel's NUMA layout from sysfs:
//! - `devices/system/node/node<N>/cpulist` for the logical CPUs of a node
//! - `devices/system/node/node<N>/distance` for the inter-node distances
//!
//! The sysfs root is configurable so tests can point at a fixture tree.

use crate::error::TopologyError;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// One NUMA node as discovered from sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaZoneInfo {
    pub id: u64,
    /// Logical CPU ids belonging to this node.
    pub cpus: BTreeSet<u64>,
    /// Distances to every node, indexed in ascending node-id order.
    pub distances: Vec<u64>,
}

/// The machine's NUMA layout, zones ordered by id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MachineTopology {
    pub zones: Vec<NumaZoneInfo>,
}

impl MachineTopology {
    /// Discover the NUMA layout under `sysfs_root`.
    pub async fn discover(sysfs_root: &Path) -> Result<Self, TopologyError> {
        let node_dir = sysfs_root.join("devices/system/node");
        let mut entries = fs::read_dir(&node_dir).await.map_err(|e| TopologyError::Sysfs {
            path: node_dir.clone(),
            source: e,
        })?;

        let mut zones = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| TopologyError::Sysfs {
            path: node_dir.clone(),
            source: e,
        })? {
            let name = entry.file_name();
            let Some(id) = parse_node_id(&name.to_string_lossy()) else {
                continue;
            };

            let path = entry.path();
            let cpus = parse_cpu_list(&read_sysfs(&path.join("cpulist")).await?)
                .map_err(|reason| TopologyError::SysfsParse {
                    path: path.join("cpulist"),
                    reason,
                })?;
            let distances = parse_distances(&read_sysfs(&path.join("distance")).await?)
                .map_err(|reason| TopologyError::SysfsParse {
                    path: path.join("distance"),
                    reason,
                })?;

            zones.push(NumaZoneInfo { id, cpus, distances });
        }

        zones.sort_by_key(|z| z.id);
        info!(zones = zones.len(), "Discovered NUMA topology");
        Ok(Self { zones })
    }

    /// NUMA node owning the given logical CPU.
    pub fn zone_for_cpu(&self, cpu: u64) -> Option<u64> {
        self.zones
            .iter()
            .find(|z| z.cpus.contains(&cpu))
            .map(|z| z.id)
    }
}

async fn read_sysfs(path: &PathBuf) -> Result<String, TopologyError> {
    fs::read_to_string(path).await.map_err(|e| TopologyError::Sysfs {
        path: path.clone(),
        source: e,
    })
}

fn parse_node_id(name: &str) -> Option<u64> {
    name.strip_prefix("node")?.parse().ok()
}

/// Parse kernel cpulist syntax: comma-separated entries, each a single id or
/// an inclusive range (`0-5,12-17`). An empty list (memory-only node) is
/// valid.
pub fn parse_cpu_list(raw: &str) -> Result<BTreeSet<u64>, String> {
    let mut cpus = BTreeSet::new();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(cpus);
    }

    for part in trimmed.split(',') {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u64 = start
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad range start {part:?}"))?;
                let end: u64 = end
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad range end {part:?}"))?;
                if end < start {
                    return Err(format!("inverted range {part:?}"));
                }
                cpus.extend(start..=end);
            }
            None => {
                let id: u64 = part
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad cpu id {part:?}"))?;
                cpus.insert(id);
            }
        }
    }

    Ok(cpus)
}

/// Parse the whitespace-separated distance vector.
pub fn parse_distances(raw: &str) -> Result<Vec<u64>, String> {
    raw.split_whitespace()
        .map(|v| v.parse().map_err(|_| format!("bad distance {v:?}")))
        .collect()
}

//! Core library for the NUMA topology agent
//!
//! This crate implements the reactive resource-accounting pipeline:
//! - Trigger-event production (periodic timer + filesystem watches)
//! - Optional rate limiting with burst shedding
//! - Pod-resources scanning over the kubelet gRPC socket
//! - NUMA-aware aggregation into per-zone capacity/allocatable/available
//! - Reconciliation of the NodeResourceTopology object
//! - Readiness conditions, health checks, and Prometheus metrics

pub mod aggregator;
pub mod conditions;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod health;
pub mod models;
pub mod observability;
pub mod observer;
pub mod proto;
pub mod scanner;
pub mod topology;
pub mod updater;

pub use error::TopologyError;
pub use health::{HealthRegistry, HealthResponse, ReadinessResponse};
pub use models::*;
pub use observability::TopologyMetrics;

//! Pod-resources scanning
//!
//! Queries the kubelet pod-resources endpoint (a gRPC service on a Unix
//! socket) for the current per-pod resource assignments and the
//! allocatable-resources snapshot. Transport errors and timeouts abandon the
//! cycle; the next trigger retries implicitly, so no retry loop lives here.

use crate::error::TopologyError;
use crate::observability;
use crate::proto::v1::pod_resources_lister_client::PodResourcesListerClient;
use crate::proto::v1::{
    AllocatableResourcesRequest, AllocatableResourcesResponse, ListPodResourcesRequest,
    PodResources,
};
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

/// Default kubelet pod-resources socket.
pub const DEFAULT_POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

/// Names used to tag failure counters, one per upstream call.
const CALL_LIST: &str = "list";
const CALL_ALLOCATABLE: &str = "allocatable";

/// Lists current per-pod resource assignments and the allocatable snapshot.
#[async_trait]
pub trait ResourceScanner: Send {
    async fn scan(&mut self) -> Result<Vec<PodResources>, TopologyError>;

    async fn get_allocatable(&mut self)
        -> Result<AllocatableResourcesResponse, TopologyError>;
}

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub socket_path: PathBuf,
    /// Drop pods outside this namespace before aggregation.
    pub namespace: Option<String>,
    /// Bound on every upstream call; a timeout is a failed scan, never a
    /// partial one.
    pub request_timeout: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_POD_RESOURCES_SOCKET),
            namespace: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// gRPC-backed scanner over the kubelet pod-resources socket.
pub struct PodResourcesScanner {
    client: PodResourcesListerClient<Channel>,
    namespace: Option<String>,
    request_timeout: Duration,
}

impl PodResourcesScanner {
    /// Connect to the pod-resources socket.
    pub async fn connect(config: ScannerConfig) -> Result<Self, TopologyError> {
        let socket = config.socket_path.clone();

        // The endpoint URI is required but unused; the connector dials the
        // Unix socket directly.
        let channel = Endpoint::try_from("http://[::1]:50051")
            .map_err(|e| TopologyError::PodResources {
                call: "connect",
                message: e.to_string(),
            })?
            .connect_with_connector(service_fn(move |_: Uri| {
                UnixStream::connect(socket.clone())
            }))
            .await
            .map_err(|e| TopologyError::PodResources {
                call: "connect",
                message: format!(
                    "failed to dial {}: {e}",
                    config.socket_path.display()
                ),
            })?;

        debug!(socket = %config.socket_path.display(), "Connected to pod-resources endpoint");

        Ok(Self {
            client: PodResourcesListerClient::new(channel),
            namespace: config.namespace,
            request_timeout: config.request_timeout,
        })
    }

    async fn call<T, F>(
        &self,
        call: &'static str,
        fut: F,
    ) -> Result<T, TopologyError>
    where
        F: Future<Output = Result<tonic::Response<T>, tonic::Status>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => {
                observability::metrics().inc_scan_error(call);
                Err(TopologyError::PodResources {
                    call,
                    message: status.to_string(),
                })
            }
            Err(_) => {
                observability::metrics().inc_scan_error(call);
                Err(TopologyError::Timeout {
                    call,
                    timeout: self.request_timeout,
                })
            }
        }
    }
}

#[async_trait]
impl ResourceScanner for PodResourcesScanner {
    async fn scan(&mut self) -> Result<Vec<PodResources>, TopologyError> {
        let mut client = self.client.clone();
        let response = self
            .call(CALL_LIST, client.list(ListPodResourcesRequest {}))
            .await?;

        Ok(filter_namespace(response.pod_resources, self.namespace.as_deref()))
    }

    async fn get_allocatable(
        &mut self,
    ) -> Result<AllocatableResourcesResponse, TopologyError> {
        let mut client = self.client.clone();
        self.call(
            CALL_ALLOCATABLE,
            client.get_allocatable_resources(AllocatableResourcesRequest {}),
        )
        .await
    }
}

/// Keep only pods from `namespace`, or everything when no filter is set.
fn filter_namespace(pods: Vec<PodResources>, namespace: Option<&str>) -> Vec<PodResources> {
    match namespace {
        Some(ns) => pods.into_iter().filter(|p| p.namespace == ns).collect(),
        None => pods,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(namespace: &str, name: &str) -> PodResources {
        PodResources {
            name: name.to_string(),
            namespace: namespace.to_string(),
            containers: Vec::new(),
        }
    }

    #[test]
    fn test_filter_namespace_keeps_matching_pods() {
        let pods = vec![pod("default", "a"), pod("kube-system", "b")];

        let filtered = filter_namespace(pods, Some("default"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "a");
    }

    #[test]
    fn test_filter_namespace_passes_all_without_filter() {
        let pods = vec![pod("default", "a"), pod("kube-system", "b")];
        assert_eq!(filter_namespace(pods, None).len(), 2);
    }

    #[test]
    fn test_scanner_config_defaults() {
        let config = ScannerConfig::default();
        assert_eq!(
            config.socket_path,
            PathBuf::from(DEFAULT_POD_RESOURCES_SOCKET)
        );
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.namespace.is_none());
    }
}

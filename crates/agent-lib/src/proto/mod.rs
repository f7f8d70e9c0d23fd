//! kubelet pod-resources API types
//!
//! Hand-written prost structs and client mirroring the kubelet
//! `v1.PodResourcesLister` service, so no protoc invocation is needed at
//! build time. Wire tags match the upstream proto definition.

pub mod v1 {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct ListPodResourcesRequest {}

    #[derive(Clone, PartialEq, Message)]
    pub struct ListPodResourcesResponse {
        #[prost(message, repeated, tag = "1")]
        pub pod_resources: Vec<PodResources>,
    }

    /// Per-pod resource assignments as reported by the kubelet.
    #[derive(Clone, PartialEq, Message)]
    pub struct PodResources {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub namespace: String,
        #[prost(message, repeated, tag = "3")]
        pub containers: Vec<ContainerResources>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ContainerResources {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, repeated, tag = "2")]
        pub devices: Vec<ContainerDevices>,
        #[prost(int64, repeated, tag = "3")]
        pub cpu_ids: Vec<i64>,
        #[prost(message, repeated, tag = "4")]
        pub memory: Vec<ContainerMemory>,
    }

    /// A memory-type assignment (`memory` or a hugepage resource); `size` is
    /// in bytes.
    #[derive(Clone, PartialEq, Message)]
    pub struct ContainerMemory {
        #[prost(string, tag = "1")]
        pub memory_type: String,
        #[prost(uint64, tag = "2")]
        pub size: u64,
        #[prost(message, optional, tag = "3")]
        pub topology: Option<TopologyInfo>,
    }

    /// Device assignments for one resource name, with optional NUMA hints.
    #[derive(Clone, PartialEq, Message)]
    pub struct ContainerDevices {
        #[prost(string, tag = "1")]
        pub resource_name: String,
        #[prost(string, repeated, tag = "2")]
        pub device_ids: Vec<String>,
        #[prost(message, optional, tag = "3")]
        pub topology: Option<TopologyInfo>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TopologyInfo {
        #[prost(message, repeated, tag = "1")]
        pub nodes: Vec<NumaNode>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct NumaNode {
        #[prost(int64, tag = "1")]
        pub id: i64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct AllocatableResourcesRequest {}

    /// Snapshot of everything the kubelet considers allocatable on the node.
    #[derive(Clone, PartialEq, Message)]
    pub struct AllocatableResourcesResponse {
        #[prost(message, repeated, tag = "1")]
        pub devices: Vec<ContainerDevices>,
        #[prost(int64, repeated, tag = "2")]
        pub cpu_ids: Vec<i64>,
        #[prost(message, repeated, tag = "3")]
        pub memory: Vec<ContainerMemory>,
    }

    pub mod pod_resources_lister_client {
        use super::*;
        use tonic::codegen::*;

        /// Client for the kubelet `v1.PodResourcesLister` service.
        #[derive(Debug, Clone)]
        pub struct PodResourcesListerClient<T> {
            inner: tonic::client::Grpc<T>,
        }

        impl PodResourcesListerClient<tonic::transport::Channel> {
            pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
            where
                D: TryInto<tonic::transport::Endpoint>,
                D::Error: Into<StdError>,
            {
                let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
                Ok(Self::new(conn))
            }
        }

        impl<T> PodResourcesListerClient<T>
        where
            T: tonic::client::GrpcService<tonic::body::BoxBody>,
            T::Error: Into<StdError>,
            T::ResponseBody: Body<Data = Bytes> + Send + 'static,
            <T::ResponseBody as Body>::Error: Into<StdError> + Send,
        {
            pub fn new(inner: T) -> Self {
                let inner = tonic::client::Grpc::new(inner);
                Self { inner }
            }

            pub async fn list(
                &mut self,
                request: impl tonic::IntoRequest<ListPodResourcesRequest>,
            ) -> std::result::Result<tonic::Response<ListPodResourcesResponse>, tonic::Status>
            {
                self.inner.ready().await.map_err(|e| {
                    tonic::Status::new(
                        tonic::Code::Unknown,
                        format!("Service was not ready: {}", e.into()),
                    )
                })?;
                let codec = tonic::codec::ProstCodec::default();
                let path =
                    http::uri::PathAndQuery::from_static("/v1.PodResourcesLister/List");
                let mut req = request.into_request();
                req.extensions_mut()
                    .insert(GrpcMethod::new("v1.PodResourcesLister", "List"));
                self.inner.unary(req, path, codec).await
            }

            pub async fn get_allocatable_resources(
                &mut self,
                request: impl tonic::IntoRequest<AllocatableResourcesRequest>,
            ) -> std::result::Result<tonic::Response<AllocatableResourcesResponse>, tonic::Status>
            {
                self.inner.ready().await.map_err(|e| {
                    tonic::Status::new(
                        tonic::Code::Unknown,
                        format!("Service was not ready: {}", e.into()),
                    )
                })?;
                let codec = tonic::codec::ProstCodec::default();
                let path = http::uri::PathAndQuery::from_static(
                    "/v1.PodResourcesLister/GetAllocatableResources",
                );
                let mut req = request.into_request();
                req.extensions_mut().insert(GrpcMethod::new(
                    "v1.PodResourcesLister",
                    "GetAllocatableResources",
                ));
                self.inner.unary(req, path, codec).await
            }
        }
    }
}

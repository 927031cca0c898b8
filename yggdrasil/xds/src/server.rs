use crate::{sotw, ResourceType, SnapshotCache};
use futures::prelude::*;
use std::pin::Pin;
use tonic::{Request, Response, Status, Streaming};
use xds_api::pb::envoy::service::{
    cluster::v3::cluster_discovery_service_server::{
        ClusterDiscoveryService, ClusterDiscoveryServiceServer,
    },
    discovery::v3::{
        aggregated_discovery_service_server::{
            AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
        },
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    },
    endpoint::v3::endpoint_discovery_service_server::{
        EndpointDiscoveryService, EndpointDiscoveryServiceServer,
    },
    listener::v3::listener_discovery_service_server::{
        ListenerDiscoveryService, ListenerDiscoveryServiceServer,
    },
    route::v3::route_discovery_service_server::{
        RouteDiscoveryService, RouteDiscoveryServiceServer,
    },
};

type DeltaStream = Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

/// Terminates the discovery protocol: the aggregated service plus one
/// per-type service, each in streaming and single-shot form.
///
/// Every open stream is bound to the cache entry of the node id resolved from
/// its first request; a transport error closes only that stream.
#[derive(Clone)]
pub struct DiscoveryServer {
    cache: SnapshotCache,
    shutdown: drain::Watch,
}

impl DiscoveryServer {
    pub fn new(cache: SnapshotCache, shutdown: drain::Watch) -> Self {
        Self { cache, shutdown }
    }

    pub fn aggregated(&self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self.clone())
    }

    pub fn listeners(&self) -> ListenerDiscoveryServiceServer<Self> {
        ListenerDiscoveryServiceServer::new(self.clone())
    }

    pub fn clusters(&self) -> ClusterDiscoveryServiceServer<Self> {
        ClusterDiscoveryServiceServer::new(self.clone())
    }

    pub fn routes(&self) -> RouteDiscoveryServiceServer<Self> {
        RouteDiscoveryServiceServer::new(self.clone())
    }

    pub fn endpoints(&self) -> EndpointDiscoveryServiceServer<Self> {
        EndpointDiscoveryServiceServer::new(self.clone())
    }

    fn stream(
        &self,
        requests: Streaming<DiscoveryRequest>,
        default_type: Option<ResourceType>,
    ) -> sotw::DiscoveryResponseStream {
        sotw::stream(
            self.cache.clone(),
            requests,
            default_type,
            self.shutdown.clone(),
        )
    }

    fn fetch(
        &self,
        req: DiscoveryRequest,
        default_type: Option<ResourceType>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        sotw::fetch(&self.cache, &req, default_type).map(Response::new)
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = sotw::DiscoveryResponseStream;
    type DeltaAggregatedResourcesStream = DeltaStream;

    async fn stream_aggregated_resources(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(Response::new(self.stream(req.into_inner(), None)))
    }

    async fn delta_aggregated_resources(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not served"))
    }
}

#[tonic::async_trait]
impl ListenerDiscoveryService for DiscoveryServer {
    type StreamListenersStream = sotw::DiscoveryResponseStream;
    type DeltaListenersStream = DeltaStream;

    async fn stream_listeners(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamListenersStream>, Status> {
        Ok(Response::new(
            self.stream(req.into_inner(), Some(ResourceType::Listener)),
        ))
    }

    async fn delta_listeners(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaListenersStream>, Status> {
        Err(Status::unimplemented("delta xDS is not served"))
    }

    async fn fetch_listeners(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(req.into_inner(), Some(ResourceType::Listener))
    }
}

#[tonic::async_trait]
impl ClusterDiscoveryService for DiscoveryServer {
    type StreamClustersStream = sotw::DiscoveryResponseStream;
    type DeltaClustersStream = DeltaStream;

    async fn stream_clusters(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamClustersStream>, Status> {
        Ok(Response::new(
            self.stream(req.into_inner(), Some(ResourceType::Cluster)),
        ))
    }

    async fn delta_clusters(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaClustersStream>, Status> {
        Err(Status::unimplemented("delta xDS is not served"))
    }

    async fn fetch_clusters(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(req.into_inner(), Some(ResourceType::Cluster))
    }
}

#[tonic::async_trait]
impl RouteDiscoveryService for DiscoveryServer {
    type StreamRoutesStream = sotw::DiscoveryResponseStream;
    type DeltaRoutesStream = DeltaStream;

    async fn stream_routes(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamRoutesStream>, Status> {
        Ok(Response::new(
            self.stream(req.into_inner(), Some(ResourceType::Route)),
        ))
    }

    async fn delta_routes(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaRoutesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not served"))
    }

    async fn fetch_routes(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(req.into_inner(), Some(ResourceType::Route))
    }
}

#[tonic::async_trait]
impl EndpointDiscoveryService for DiscoveryServer {
    type StreamEndpointsStream = sotw::DiscoveryResponseStream;
    type DeltaEndpointsStream = DeltaStream;

    async fn stream_endpoints(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamEndpointsStream>, Status> {
        Ok(Response::new(
            self.stream(req.into_inner(), Some(ResourceType::Endpoint)),
        ))
    }

    async fn delta_endpoints(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaEndpointsStream>, Status> {
        Err(Status::unimplemented("delta xDS is not served"))
    }

    async fn fetch_endpoints(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(req.into_inner(), Some(ResourceType::Endpoint))
    }
}

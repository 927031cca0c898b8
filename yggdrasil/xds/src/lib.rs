#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod server;
mod sotw;

pub use self::{
    cache::{IdHasher, NodeHash, SnapshotCache},
    server::DiscoveryServer,
};

use xds_api::pb::google::protobuf::Any;

/// The xDS resource types this control plane serves.
///
/// Only listeners and clusters ever carry resources; routes and endpoints are
/// served empty so subscribers requesting them don't stall.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Cluster,
    Endpoint,
    Listener,
    Route,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Cluster,
        ResourceType::Endpoint,
        ResourceType::Listener,
        ResourceType::Route,
    ];

    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            ResourceType::Endpoint => {
                "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment"
            }
            ResourceType::Listener => "type.googleapis.com/envoy.config.listener.v3.Listener",
            ResourceType::Route => {
                "type.googleapis.com/envoy.config.route.v3.RouteConfiguration"
            }
        }
    }

    pub fn from_type_url(url: &str) -> Option<ResourceType> {
        Self::ALL.into_iter().find(|t| t.type_url() == url)
    }

    fn index(&self) -> usize {
        match self {
            ResourceType::Cluster => 0,
            ResourceType::Endpoint => 1,
            ResourceType::Listener => 2,
            ResourceType::Route => 3,
        }
    }
}

/// One resource type's packed resources plus the version stamp they were
/// generated under.
#[derive(Clone, Debug, Default)]
pub struct ResourceSet {
    pub version: String,
    pub resources: Vec<Any>,
}

/// A versioned bundle of every resource type, installed atomically per node.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    sets: [ResourceSet; 4],
}

impl Snapshot {
    pub fn set_resources(
        &mut self,
        resource_type: ResourceType,
        version: String,
        resources: Vec<Any>,
    ) {
        self.sets[resource_type.index()] = ResourceSet { version, resources };
    }

    pub fn resources(&self, resource_type: ResourceType) -> &ResourceSet {
        &self.sets[resource_type.index()]
    }

    pub fn version(&self, resource_type: ResourceType) -> &str {
        &self.sets[resource_type.index()].version
    }
}

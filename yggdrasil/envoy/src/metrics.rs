use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use yggdrasil_core::Ingress;

/// Everything the control plane exports about its own view of the world.
#[derive(Clone, Debug)]
pub struct Metrics {
    pub(crate) cluster_updates: Counter,
    pub(crate) listener_updates: Counter,
    pub(crate) ingresses: Gauge,
    pub(crate) clusters: Gauge,
    pub(crate) virtual_hosts: Gauge,
    cluster_in_maintenance: Family<SourceClusterLabels, Gauge>,
    upstream_info: Family<UpstreamLabels, Gauge>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct SourceClusterLabels {
    cluster: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct UpstreamLabels {
    envoy_cluster_name: String,
    upstream: String,
    namespace: String,
    ingressclass: String,
    k8s_cluster: String,
    ingress: String,
}

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let cluster_updates = Counter::default();
        reg.register(
            "cluster_updates",
            "Number of times the clusters have been updated",
            cluster_updates.clone(),
        );

        let listener_updates = Counter::default();
        reg.register(
            "listener_updates",
            "Number of times the listener has been updated",
            listener_updates.clone(),
        );

        let ingresses = Gauge::default();
        reg.register(
            "ingresses",
            "Total number of matching ingress objects",
            ingresses.clone(),
        );

        let clusters = Gauge::default();
        reg.register(
            "clusters",
            "Total number of clusters generated",
            clusters.clone(),
        );

        let virtual_hosts = Gauge::default();
        reg.register(
            "virtual_hosts",
            "Total number of virtual hosts generated",
            virtual_hosts.clone(),
        );

        let cluster_in_maintenance = Family::<SourceClusterLabels, Gauge>::default();
        reg.register(
            "kubernetes_cluster_in_maintenance",
            "Whether a source cluster is in maintenance mode",
            cluster_in_maintenance.clone(),
        );

        let upstream_info = Family::<UpstreamLabels, Gauge>::default();
        reg.register(
            "upstream_info",
            "Upstreams contributing to each envoy cluster",
            upstream_info.clone(),
        );

        Self {
            cluster_updates,
            listener_updates,
            ingresses,
            clusters,
            virtual_hosts,
            cluster_in_maintenance,
            upstream_info,
        }
    }

    pub fn set_maintenance(&self, cluster: &str, maintenance: bool) {
        self.cluster_in_maintenance
            .get_or_create(&SourceClusterLabels {
                cluster: cluster.to_string(),
            })
            .set(maintenance as i64);
    }

    /// Replaces the per-upstream info series with the current generation's
    /// label sets; series for upstreams that disappeared are dropped.
    pub(crate) fn record_upstreams(&self, ingresses: &[&Ingress]) {
        self.upstream_info.clear();
        for ingress in ingresses {
            for host in ingress.rules_hosts.iter().filter(|h| !h.is_empty()) {
                for upstream in ingress.upstreams.iter().filter(|u| !u.is_empty()) {
                    self.upstream_info
                        .get_or_create(&UpstreamLabels {
                            envoy_cluster_name: host.replace('.', "_"),
                            upstream: upstream.clone(),
                            namespace: ingress.namespace.clone(),
                            ingressclass: ingress.usable_class().unwrap_or_default().to_string(),
                            k8s_cluster: ingress.source_cluster.clone(),
                            ingress: ingress.name.clone(),
                        })
                        .set(1);
                }
            }
        }
    }
}

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct WatchLabels {
    cluster: String,
    resource: &'static str,
}

/// Health of the per-cluster watch streams.
#[derive(Clone, Debug, Default)]
pub struct WatcherMetrics {
    disconnected: Family<WatchLabels, Gauge>,
}

impl WatcherMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let disconnected = Family::<WatchLabels, Gauge>::default();
        reg.register(
            "watch_disconnected",
            "Whether a source cluster watch is currently disconnected and backing off",
            disconnected.clone(),
        );
        Self { disconnected }
    }

    pub(crate) fn set_disconnected(&self, cluster: &str, resource: &'static str, down: bool) {
        self.disconnected
            .get_or_create(&WatchLabels {
                cluster: cluster.to_string(),
                resource,
            })
            .set(down as i64);
    }
}

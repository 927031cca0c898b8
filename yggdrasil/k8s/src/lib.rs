#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod aggregator;
mod client;
mod ingress;
mod metrics;
mod watcher;

pub use self::{
    aggregator::{run_ticker, Aggregator},
    client::{kubeconfig_client, make_client, SourceCluster},
    ingress::{probe_ingress_api, IngressApi},
    metrics::WatcherMetrics,
    watcher::ClusterWatcher,
};

pub use kube::Client;

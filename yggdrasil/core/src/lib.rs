#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod duration;
pub mod ingress;
pub mod retry;

pub use self::{
    config::{Cluster, DefaultTimeouts, LbEndpoint, ProxyConfig, UpstreamHttpVersion, VirtualHost},
    duration::GoDuration,
    ingress::{Ingress, TlsEntry, TlsSecret, INGRESS_CLASS_ANNOTATION},
    retry::RetryPolicy,
};

/// A change notification flowing from the watchers to the snapshotter.
///
/// Payloads are intentionally absent: the snapshotter always recomputes from
/// the full aggregated caches, so the kind is all downstream logic needs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    IngressChanged,
    SecretChanged,
    Tick,
}

/// Read access to the aggregated state of all source clusters.
pub trait IngressSource {
    /// Snapshot of every known ingress, tagged with its source cluster.
    fn ingresses(&self) -> Vec<Ingress>;

    /// Snapshot of every known TLS secret.
    fn secrets(&self) -> Vec<TlsSecret>;
}

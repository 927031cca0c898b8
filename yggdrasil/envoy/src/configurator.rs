use crate::{
    metrics::Metrics,
    translator::{class_filter, translate_ingresses, valid_ingress_filter},
};
use anyhow::Result;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use yggdrasil_core::{DefaultTimeouts, Ingress, ProxyConfig, TlsSecret, VirtualHost};
use yggdrasil_xds::{ResourceType, Snapshot};

/// A statically configured certificate: the host patterns it serves and its
/// PEM material (loaded from disk at startup).
#[derive(Clone, Debug)]
pub struct Certificate {
    pub hosts: Vec<String>,
    pub cert: String,
    pub key: String,
}

#[derive(Clone, Debug)]
pub struct UpstreamHealthCheck {
    pub timeout: Duration,
    pub interval: Duration,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl Default for UpstreamHealthCheck {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(10),
            healthy_threshold: 3,
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpExtAuthz {
    pub cluster: String,
    pub timeout: Duration,
    pub max_request_bytes: u32,
    pub allow_partial_message: bool,
    pub pack_as_bytes: bool,
    pub failure_mode_allow: bool,
}

#[derive(Clone, Debug)]
pub struct HttpGrpcLogger {
    pub name: String,
    pub cluster: String,
    pub timeout: Duration,
    pub request_headers: Vec<String>,
    pub response_headers: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TracingProvider {
    Zipkin,
}

/// Per-process policy applied on top of the translator's output.
#[derive(Clone, Debug)]
pub struct Options {
    pub node_id: String,
    pub ingress_classes: Vec<String>,
    pub certificates: Vec<Certificate>,
    pub trust_ca: Option<String>,
    pub access_log_dir: String,
    pub sync_secrets: bool,
    pub upstream_port: u32,
    pub listen_addresses: Vec<String>,
    pub listen_port: u32,
    /// Negative disables outlier detection.
    pub outlier_percentage: i32,
    /// Negative disables the retry host predicate.
    pub host_selection_retry_attempts: i64,
    pub upstream_health_check: UpstreamHealthCheck,
    pub use_remote_address: bool,
    pub strip_matching_host_port: bool,
    pub http_ext_authz: Option<HttpExtAuthz>,
    pub http_grpc_logger: Option<HttpGrpcLogger>,
    pub default_timeouts: DefaultTimeouts,
    pub default_retry_on: String,
    pub alpn_protocols: Vec<String>,
    pub tracing_provider: Option<TracingProvider>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            ingress_classes: Vec::new(),
            certificates: Vec::new(),
            trust_ca: None,
            access_log_dir: "/var/log/envoy".to_string(),
            sync_secrets: false,
            upstream_port: 443,
            listen_addresses: vec!["0.0.0.0".to_string()],
            listen_port: 10000,
            outlier_percentage: -1,
            host_selection_retry_attempts: -1,
            upstream_health_check: UpstreamHealthCheck::default(),
            use_remote_address: false,
            strip_matching_host_port: false,
            http_ext_authz: None,
            http_grpc_logger: None,
            default_timeouts: DefaultTimeouts::default(),
            default_retry_on: "5xx".to_string(),
            alpn_protocols: Vec::new(),
            tracing_provider: None,
        }
    }
}

/// Turns the aggregated caches into versioned, typed xDS resources.
///
/// Owned by the snapshotter task: `generate` is the single writer of
/// `previous` and the version stamps, so no further synchronization is
/// needed.
pub struct Configurator {
    pub(crate) options: Options,
    pub(crate) metrics: Metrics,

    previous: Option<ProxyConfig>,
    listener_version: String,
    cluster_version: String,
}

impl Configurator {
    pub fn new(options: Options, metrics: Metrics) -> Self {
        Self {
            options,
            metrics,
            previous: None,
            listener_version: String::new(),
            cluster_version: String::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.options.node_id
    }

    /// Produces a snapshot from the current caches, advancing the version
    /// stamp of each resource group whose contents changed.
    pub fn generate(&mut self, ingresses: &[Ingress], secrets: &[TlsSecret]) -> Result<Snapshot> {
        let matching = class_filter(ingresses, &self.options.ingress_classes);
        self.metrics.ingresses.set(matching.len() as i64);
        self.metrics.record_upstreams(&matching);

        let valid = valid_ingress_filter(matching);
        let config = translate_ingresses(
            &valid,
            self.options.sync_secrets,
            secrets,
            self.options.default_timeouts,
            &self.options.access_log_dir,
        );
        self.metrics.virtual_hosts.set(config.virtual_hosts.len() as i64);
        self.metrics.clusters.set(config.clusters.len() as i64);

        let (vhosts_match, clusters_match) = config.equals(self.previous.as_ref());

        let clusters = self.generate_clusters(&config);
        let listeners = self.generate_listeners(&config)?;

        if !vhosts_match {
            self.listener_version = version_stamp();
            self.metrics.listener_updates.inc();
        }
        if !clusters_match {
            self.cluster_version = version_stamp();
            self.metrics.cluster_updates.inc();
        }
        self.previous = Some(config);

        debug!(
            listener_version = %self.listener_version,
            cluster_version = %self.cluster_version,
            "generated configuration",
        );

        let mut snapshot = Snapshot::default();
        snapshot.set_resources(ResourceType::Listener, self.listener_version.clone(), listeners);
        snapshot.set_resources(ResourceType::Cluster, self.cluster_version.clone(), clusters);
        // Routes and endpoints are always inlined into the listener and
        // cluster resources; the sets are served empty but versioned so
        // subscribers requesting them don't stall.
        snapshot.set_resources(ResourceType::Route, self.cluster_version.clone(), Vec::new());
        snapshot.set_resources(ResourceType::Endpoint, self.cluster_version.clone(), Vec::new());
        Ok(snapshot)
    }

    /// The statically configured certificates whose host patterns cover this
    /// virtual host. A bare `*` matches everything, unlike `*.thing.com`
    /// which only covers one label.
    pub(crate) fn match_certificates(&self, vhost: &VirtualHost) -> Vec<usize> {
        let mut matched = Vec::new();
        for (idx, certificate) in self.options.certificates.iter().enumerate() {
            if certificate
                .hosts
                .iter()
                .any(|pattern| pattern == "*" || compare_hosts(pattern, &vhost.host))
            {
                matched.push(idx);
            }
        }
        matched
    }
}

/// Segment-wise host comparison where `*` covers exactly one label.
pub(crate) fn compare_hosts(pattern: &str, host: &str) -> bool {
    let pattern_parts: Vec<_> = pattern.split('.').collect();
    let host_parts: Vec<_> = host.split('.').collect();
    pattern_parts.len() == host_parts.len()
        && pattern_parts
            .iter()
            .zip(&host_parts)
            .all(|(p, h)| *p == "*" || p == h)
}

fn version_stamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_string()
}

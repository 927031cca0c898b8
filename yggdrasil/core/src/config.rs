use std::time::Duration;

/// Default timeouts applied when an ingress carries no overriding annotation.
#[derive(Copy, Clone, Debug)]
pub struct DefaultTimeouts {
    /// Upstream connect timeout.
    pub cluster: Duration,
    /// Whole-route timeout.
    pub route: Duration,
    /// Per-attempt timeout within the retry policy.
    pub per_try: Duration,
}

impl Default for DefaultTimeouts {
    fn default() -> Self {
        Self {
            cluster: Duration::from_secs(30),
            route: Duration::from_secs(15),
            per_try: Duration::from_secs(5),
        }
    }
}

/// One routing entry per externally visible hostname.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualHost {
    pub host: String,

    /// Always the host with dots mapped to underscores; pairs this virtual
    /// host with exactly one [`Cluster`].
    pub upstream_cluster: String,

    pub timeout: Duration,
    pub per_try_timeout: Duration,

    /// Inline PEM material selected from a synced TLS secret.
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,

    /// Comma-separated retry-on reasons overriding the process default.
    pub retry_on: Option<String>,
}

/// A weighted upstream address within a cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LbEndpoint {
    pub host: String,
    pub weight: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum UpstreamHttpVersion {
    #[default]
    Http2,
    Http1,
}

/// An addressable pool of upstream load-balancer endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub virtual_host: String,

    /// Empty disables active health checking.
    pub health_check_path: String,

    /// Host header for active health checks; differs from `virtual_host` only
    /// when the virtual host is a wildcard.
    pub health_check_host: String,

    /// Upstream connect timeout.
    pub timeout: Duration,

    pub http_version: UpstreamHttpVersion,
    pub hosts: Vec<LbEndpoint>,
}

impl Cluster {
    /// Order-insensitive comparison: endpoint encounter order is preserved in
    /// the emitted config but must not affect change detection.
    fn same(&self, other: &Cluster) -> bool {
        self.name == other.name
            && self.virtual_host == other.virtual_host
            && self.health_check_path == other.health_check_path
            && self.health_check_host == other.health_check_host
            && self.timeout == other.timeout
            && self.http_version == other.http_version
            && sorted_endpoints(&self.hosts) == sorted_endpoints(&other.hosts)
    }
}

fn sorted_endpoints(hosts: &[LbEndpoint]) -> Vec<&LbEndpoint> {
    let mut hosts = hosts.iter().collect::<Vec<_>>();
    hosts.sort_unstable_by(|a, b| a.host.cmp(&b.host));
    hosts
}

/// The translator's output: everything needed to synthesize one listener and
/// its clusters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub virtual_hosts: Vec<VirtualHost>,
    pub clusters: Vec<Cluster>,
    pub access_log_dir: String,
}

impl ProxyConfig {
    /// Compares against the previous generation, returning
    /// `(vhosts_match, clusters_match)`.
    ///
    /// Both sides are sorted by identity first so that encounter order never
    /// bumps a version stamp.
    pub fn equals(&self, old: Option<&ProxyConfig>) -> (bool, bool) {
        let Some(old) = old else {
            return (false, false);
        };
        (
            virtual_hosts_equal(&self.virtual_hosts, &old.virtual_hosts),
            clusters_equal(&self.clusters, &old.clusters),
        )
    }
}

fn virtual_hosts_equal(a: &[VirtualHost], b: &[VirtualHost]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    fn sort(hosts: &[VirtualHost]) -> Vec<&VirtualHost> {
        let mut hosts = hosts.iter().collect::<Vec<_>>();
        hosts.sort_unstable_by(|a, b| a.host.cmp(&b.host));
        hosts
    }
    sort(a)
        .into_iter()
        .zip(sort(b))
        .all(|(a, b)| a == b)
}

fn clusters_equal(a: &[Cluster], b: &[Cluster]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    fn sort(clusters: &[Cluster]) -> Vec<&Cluster> {
        let mut clusters = clusters.iter().collect::<Vec<_>>();
        clusters.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        clusters
    }
    sort(a)
        .into_iter()
        .zip(sort(b))
        .all(|(a, b)| a.same(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vhost(host: &str) -> VirtualHost {
        VirtualHost {
            host: host.to_string(),
            upstream_cluster: host.replace('.', "_"),
            timeout: Duration::from_secs(15),
            per_try_timeout: Duration::from_secs(5),
            tls_cert: None,
            tls_key: None,
            retry_on: None,
        }
    }

    fn cluster(name: &str, hosts: &[(&str, u32)]) -> Cluster {
        Cluster {
            name: name.to_string(),
            virtual_host: name.replace('_', "."),
            health_check_path: String::new(),
            health_check_host: name.replace('_', "."),
            timeout: Duration::from_secs(30),
            http_version: UpstreamHttpVersion::default(),
            hosts: hosts
                .iter()
                .map(|(h, w)| LbEndpoint {
                    host: h.to_string(),
                    weight: *w,
                })
                .collect(),
        }
    }

    #[test]
    fn virtual_host_changes_are_detected() {
        let a = vhost("foo");
        assert_eq!(a, vhost("foo"));

        let mut b = vhost("foo");
        b.timeout = Duration::from_secs(5);
        assert_ne!(a, b);

        let mut c = vhost("foo");
        c.per_try_timeout = Duration::from_secs(1);
        assert_ne!(a, c);
    }

    #[test]
    fn cluster_comparison_ignores_endpoint_order() {
        let a = cluster("foo", &[("host1", 1), ("host2", 1)]);
        let b = cluster("foo", &[("host2", 1), ("host1", 1)]);
        assert!(a.same(&b));
    }

    #[test]
    fn cluster_changes_are_detected() {
        let a = cluster("foo", &[("host1", 1), ("host2", 1)]);
        assert!(!a.same(&cluster("bar", &[("host1", 1), ("host2", 1)])));
        assert!(!a.same(&cluster("foo", &[("host1", 1)])));
        assert!(!a.same(&cluster("foo", &[("bad1", 1), ("bad2", 1)])));
        assert!(!a.same(&cluster("foo", &[("host1", 1), ("host2", 2)])));

        let mut slow = cluster("foo", &[("host1", 1), ("host2", 1)]);
        slow.timeout = Duration::from_secs(5);
        assert!(!a.same(&slow));

        let mut hc = cluster("foo", &[("host1", 1), ("host2", 1)]);
        hc.health_check_path = "/healthz".to_string();
        assert!(!a.same(&hc));
    }

    #[test]
    fn config_equality_is_order_independent() {
        let a = ProxyConfig {
            virtual_hosts: vec![vhost("foo.com"), vhost("bar.com")],
            clusters: vec![cluster("foo_com", &[("x", 1)]), cluster("bar_com", &[("y", 1)])],
            access_log_dir: "/var/log/envoy".to_string(),
        };
        let b = ProxyConfig {
            virtual_hosts: vec![vhost("bar.com"), vhost("foo.com")],
            clusters: vec![cluster("bar_com", &[("y", 1)]), cluster("foo_com", &[("x", 1)])],
            access_log_dir: "/var/log/envoy".to_string(),
        };
        assert_eq!(a.equals(Some(&b)), (true, true));
    }

    #[test]
    fn config_equality_against_nothing_matches_nothing() {
        let a = ProxyConfig::default();
        assert_eq!(a.equals(None), (false, false));
    }

    #[test]
    fn partial_config_changes_are_partial() {
        let a = ProxyConfig {
            virtual_hosts: vec![vhost("foo.com")],
            clusters: vec![cluster("foo_com", &[("one", 1)])],
            access_log_dir: String::new(),
        };
        let b = ProxyConfig {
            virtual_hosts: vec![vhost("foo.com")],
            clusters: vec![cluster("foo_com", &[("two", 1)])],
            access_log_dir: String::new(),
        };
        assert_eq!(a.equals(Some(&b)), (true, false));
    }
}

use crate::tls::validate_tls_secret;
use ahash::AHashMap as HashMap;
use tracing::{debug, info, warn};
use yggdrasil_core::{
    Cluster, DefaultTimeouts, GoDuration, Ingress, LbEndpoint, ProxyConfig, RetryPolicy,
    TlsSecret, UpstreamHttpVersion, VirtualHost, INGRESS_CLASS_ANNOTATION,
};

const ANNOTATION_WEIGHT: &str = "yggdrasil.uswitch.com/weight";
const ANNOTATION_HEALTHCHECK_PATH: &str = "yggdrasil.uswitch.com/healthcheck-path";
const ANNOTATION_HEALTHCHECK_HOST: &str = "yggdrasil.uswitch.com/healthcheck-host";
const ANNOTATION_TIMEOUT: &str = "yggdrasil.uswitch.com/timeout";
const ANNOTATION_CLUSTER_TIMEOUT: &str = "yggdrasil.uswitch.com/cluster-timeout";
const ANNOTATION_ROUTE_TIMEOUT: &str = "yggdrasil.uswitch.com/route-timeout";
const ANNOTATION_PER_TRY_TIMEOUT: &str = "yggdrasil.uswitch.com/per-try-timeout";
const ANNOTATION_RETRY_ON: &str = "yggdrasil.uswitch.com/retry-on";
const ANNOTATION_UPSTREAM_HTTP_VERSION: &str = "yggdrasil.uswitch.com/upstream-http-version";

/// Keeps the ingresses whose declared class is one of ours. The legacy
/// annotation and the structured field are both consulted, as controllers
/// have historically honored either.
pub(crate) fn class_filter<'a>(
    ingresses: &'a [Ingress],
    ingress_classes: &[String],
) -> Vec<&'a Ingress> {
    ingresses
        .iter()
        .filter(|ingress| {
            ingress_classes.iter().any(|class| {
                ingress
                    .annotations
                    .get(INGRESS_CLASS_ANNOTATION)
                    .is_some_and(|c| c == class)
                    || ingress.class.as_deref() == Some(class)
            })
        })
        .collect()
}

/// Drops ingresses that could never route: no resolvable upstream, or no
/// rule host to route for.
pub(crate) fn valid_ingress_filter<'a>(ingresses: Vec<&'a Ingress>) -> Vec<&'a Ingress> {
    ingresses
        .into_iter()
        .filter(|ingress| {
            if !ingress.upstreams.iter().any(|u| !u.is_empty()) {
                debug!(
                    namespace = %ingress.namespace,
                    name = %ingress.name,
                    "no load-balancer hostname or ip found in ingress",
                );
                return false;
            }
            if !ingress.rules_hosts.iter().any(|h| !h.is_empty()) {
                debug!(
                    namespace = %ingress.namespace,
                    name = %ingress.name,
                    "no rule host found in ingress",
                );
                return false;
            }
            true
        })
        .collect()
}

/// Whether `host` is covered by the TLS `pattern`, with single-label
/// wildcard support: `*.a.b` covers `*.a.b` and `x.a.b`, but not `a.b` or
/// `x.y.a.b`.
pub(crate) fn host_match(pattern: &str, host: &str) -> bool {
    let expr = format!(
        "^{}$",
        pattern
            .replace('.', "\\.")
            .replace('*', "(?:\\*|[a-z0-9][a-z0-9-_]*)")
    );
    match regex::Regex::new(&expr) {
        Ok(re) => re.is_match(host),
        Err(error) => {
            warn!(%error, pattern, "error in ingress hostname comparison");
            false
        }
    }
}

fn is_wildcard(rule_host: &str) -> bool {
    rule_host.starts_with("*.")
}

fn validate_subdomain(rule_host: &str, host: &str) -> bool {
    let suffix = rule_host.strip_prefix("*.").unwrap_or(rule_host);
    host.ends_with(suffix)
}

/// The virtual host and cluster being assembled for one rule host.
struct EnvoyIngress {
    vhost: VirtualHost,
    cluster: Cluster,
}

impl EnvoyIngress {
    fn new(host: &str, timeouts: DefaultTimeouts) -> Self {
        let cluster_name = host.replace('.', "_");
        Self {
            vhost: VirtualHost {
                host: host.to_string(),
                upstream_cluster: cluster_name.clone(),
                timeout: timeouts.route,
                per_try_timeout: timeouts.per_try,
                tls_cert: None,
                tls_key: None,
                retry_on: None,
            },
            cluster: Cluster {
                name: cluster_name,
                virtual_host: host.to_string(),
                health_check_path: String::new(),
                health_check_host: host.to_string(),
                timeout: timeouts.cluster,
                http_version: UpstreamHttpVersion::default(),
                hosts: Vec::new(),
            },
        }
    }

    fn add_upstream(&mut self, host: &str, weight: u32) {
        if self.cluster.hosts.iter().any(|h| h.host == host) {
            debug!(
                upstream = host,
                cluster = %self.cluster.name,
                "duplicate upstream elided",
            );
            return;
        }
        self.cluster.hosts.push(LbEndpoint {
            host: host.to_string(),
            weight,
        });
    }

    fn apply_annotations(&mut self, ingress: &Ingress) {
        if is_wildcard(&self.vhost.host) {
            if let Some(host) = ingress.annotation(ANNOTATION_HEALTHCHECK_HOST) {
                if validate_subdomain(&self.vhost.host, host) {
                    self.cluster.health_check_host = host.to_string();
                } else {
                    warn!(
                        healthcheck_host = host,
                        rule_host = %self.vhost.host,
                        "health-check host is not a subdomain of the wildcard, skipping annotation",
                    );
                    self.cluster.health_check_host = self.vhost.host.clone();
                }
            } else {
                warn!(
                    rule_host = %self.vhost.host,
                    "active health checks against a wildcard host need an explicit healthcheck-host",
                );
            }
        }

        if let Some(path) = ingress.annotation(ANNOTATION_HEALTHCHECK_PATH) {
            self.cluster.health_check_path = path.to_string();
        }

        if let Some(Ok(GoDuration(timeout))) =
            ingress.annotation(ANNOTATION_TIMEOUT).map(str::parse)
        {
            self.cluster.timeout = timeout;
            self.vhost.timeout = timeout;
            self.vhost.per_try_timeout = timeout;
        }
        if let Some(Ok(GoDuration(timeout))) = ingress
            .annotation(ANNOTATION_CLUSTER_TIMEOUT)
            .map(str::parse)
        {
            self.cluster.timeout = timeout;
        }
        if let Some(Ok(GoDuration(timeout))) =
            ingress.annotation(ANNOTATION_ROUTE_TIMEOUT).map(str::parse)
        {
            self.vhost.timeout = timeout;
        }
        if let Some(Ok(GoDuration(timeout))) = ingress
            .annotation(ANNOTATION_PER_TRY_TIMEOUT)
            .map(str::parse)
        {
            self.vhost.per_try_timeout = timeout;
        }

        if let Some(retry_on) = ingress.annotation(ANNOTATION_RETRY_ON) {
            match retry_on.parse::<RetryPolicy>() {
                Ok(policy) => self.vhost.retry_on = Some(policy.as_str().to_string()),
                Err(error) => warn!(
                    %error,
                    namespace = %ingress.namespace,
                    name = %ingress.name,
                    "invalid retry-on annotation",
                ),
            }
        }

        if let Some(version) = ingress.annotation(ANNOTATION_UPSTREAM_HTTP_VERSION) {
            self.cluster.http_version = if version == "1.1" {
                UpstreamHttpVersion::Http1
            } else {
                UpstreamHttpVersion::Http2
            };
        }
    }

    /// Attaches the first matching, valid TLS secret for `host` from this
    /// contributor, if any.
    fn apply_tls(&mut self, ingress: &Ingress, host: &str, secrets: &[TlsSecret]) {
        let Some(entry) = ingress.tls.iter().find(|t| host_match(&t.host, host)) else {
            info!(
                namespace = %ingress.namespace,
                name = %ingress.name,
                host,
                "ingress has no tls secret configured for host",
            );
            return;
        };
        let Some(secret) = secrets
            .iter()
            .find(|s| s.namespace == ingress.namespace && s.name == entry.secret_name)
        else {
            info!(
                namespace = %ingress.namespace,
                secret = %entry.secret_name,
                host,
                "secret not found for host",
            );
            return;
        };
        match validate_tls_secret(secret) {
            Ok(true) => {
                self.vhost.tls_cert = Some(secret.cert.clone());
                self.vhost.tls_key = Some(secret.key.clone());
            }
            Ok(false) => {}
            Err(error) => warn!(
                %error,
                namespace = %secret.namespace,
                name = %secret.name,
                "secret is not valid",
            ),
        }
    }
}

/// Pure translation of the current caches into a proxy configuration.
///
/// Surviving ingresses are grouped by rule host; each host yields one virtual
/// host and one cluster. Contributors are sorted by `(namespace, name)` so
/// that last-writer-wins annotation scalars resolve deterministically.
pub fn translate_ingresses(
    ingresses: &[&Ingress],
    sync_secrets: bool,
    secrets: &[TlsSecret],
    timeouts: DefaultTimeouts,
    access_log_dir: &str,
) -> ProxyConfig {
    let mut sorted = ingresses.to_vec();
    sorted.sort_by(|a, b| {
        (a.namespace.as_str(), a.name.as_str()).cmp(&(b.namespace.as_str(), b.name.as_str()))
    });

    let mut host_order: Vec<String> = Vec::new();
    let mut by_host: HashMap<String, Vec<&Ingress>> = HashMap::new();
    for &ingress in &sorted {
        for host in ingress.rules_hosts.iter().filter(|h| !h.is_empty()) {
            by_host
                .entry(host.clone())
                .or_insert_with(|| {
                    host_order.push(host.clone());
                    Vec::new()
                })
                .push(ingress);
        }
    }

    let mut config = ProxyConfig {
        access_log_dir: access_log_dir.to_string(),
        ..Default::default()
    };

    for host in &host_order {
        let contributors = &by_host[host];
        // Maintenance endpoints are excluded only while somebody else can
        // serve the host; a host served solely by maintenance clusters keeps
        // degraded service rather than none.
        let any_active = contributors.iter().any(|i| !i.maintenance);

        let mut entry = EnvoyIngress::new(host, timeouts);
        for ingress in contributors {
            if !(any_active && ingress.maintenance) {
                let weight = match ingress.annotation(ANNOTATION_WEIGHT).map(str::parse::<u32>) {
                    Some(Ok(weight)) => weight,
                    _ => 1,
                };
                if weight != 0 {
                    for upstream in ingress.upstreams.iter().filter(|u| !u.is_empty()) {
                        entry.add_upstream(upstream, weight);
                    }
                }
            }

            entry.apply_annotations(ingress);

            if sync_secrets && entry.vhost.tls_cert.is_none() && entry.vhost.tls_key.is_none() {
                entry.apply_tls(ingress, host, secrets);
            }
        }

        if entry.cluster.hosts.is_empty() {
            debug!(host = %host, "no endpoints survived, dropping host");
            continue;
        }
        config.virtual_hosts.push(entry.vhost);
        config.clusters.push(entry.cluster);
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::tests::{secret, P256_CRT, P256_KEY};
    use std::time::Duration;

    fn generic_ingress(spec_host: &str, lb_host: &str) -> Ingress {
        Ingress {
            annotations: [(INGRESS_CLASS_ANNOTATION.to_string(), "bar".to_string())]
                .into_iter()
                .collect(),
            rules_hosts: vec![spec_host.to_string()],
            upstreams: vec![lb_host.to_string()],
            ..Default::default()
        }
    }

    fn translate(ingresses: &[&Ingress]) -> ProxyConfig {
        translate_ingresses(
            ingresses,
            false,
            &[],
            DefaultTimeouts::default(),
            "/var/log/envoy",
        )
    }

    #[test]
    fn generates_for_single_ingress() {
        let ingress = generic_ingress("foo.app.com", "foo.cluster.com");
        let config = translate(&[&ingress]);

        assert_eq!(config.virtual_hosts.len(), 1);
        assert_eq!(config.virtual_hosts[0].host, "foo.app.com");
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].name, "foo_app_com");
        assert_eq!(config.clusters[0].hosts[0].host, "foo.cluster.com");
        assert_eq!(config.clusters[0].hosts[0].weight, 1);
        assert_eq!(
            config.virtual_hosts[0].upstream_cluster,
            config.clusters[0].name
        );
        assert_eq!(config.clusters[0].virtual_host, "foo.app.com");
    }

    #[test]
    fn multiple_ingresses_sharing_a_host_merge() {
        let foo = generic_ingress("app.com", "foo.com");
        let bar = generic_ingress("app.com", "bar.com");
        let config = translate(&[&foo, &bar]);

        assert_eq!(config.virtual_hosts.len(), 1);
        assert_eq!(config.virtual_hosts[0].host, "app.com");
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].name, "app_com");
        let hosts: Vec<_> = config.clusters[0]
            .hosts
            .iter()
            .map(|h| h.host.as_str())
            .collect();
        assert_eq!(hosts, ["foo.com", "bar.com"]);
    }

    #[test]
    fn duplicate_upstreams_are_elided() {
        let a = generic_ingress("app.com", "lb.com");
        let b = generic_ingress("app.com", "lb.com");
        let config = translate(&[&a, &b]);
        assert_eq!(config.clusters[0].hosts.len(), 1);
    }

    #[test]
    fn translation_is_idempotent() {
        let a = generic_ingress("foo.app.com", "foo.cluster.com");
        let b = generic_ingress("bar.app.com", "foo.bar.com");
        let first = translate(&[&a, &b]);
        let second = translate(&[&a, &b]);
        assert_eq!(first.equals(Some(&second)), (true, true));
    }

    #[test]
    fn differing_inputs_differ() {
        let a = generic_ingress("foo.bar.com", "bar.cluster.com");
        let b = generic_ingress("foo.app.com", "bar.cluster.com");
        let c = generic_ingress("foo.baz.com", "bar.cluster.com");
        let d = generic_ingress("foo.howdy.com", "bar.cluster.com");
        let first = translate(&[&a, &c, &b]);
        let second = translate(&[&a, &b, &d]);
        assert_eq!(first.equals(Some(&second)), (false, false));
    }

    #[test]
    fn endpoint_change_is_a_partial_change() {
        let a = generic_ingress("foo.app.com", "bar.cluster.com");
        let b = generic_ingress("foo.app.com", "foo.cluster.com");
        let first = translate(&[&b]);
        let second = translate(&[&a]);
        assert_eq!(second.equals(Some(&first)), (true, false));
    }

    #[test]
    fn class_filter_keeps_matching() {
        let ingress = generic_ingress("host", "balancer");
        let ingresses = vec![ingress];
        assert_eq!(class_filter(&ingresses, &["bar".to_string()]).len(), 1);
        assert_eq!(
            class_filter(&ingresses, &["another-class".to_string()]).len(),
            0
        );
    }

    #[test]
    fn class_filter_honors_structured_field() {
        let mut ingress = generic_ingress("host", "balancer");
        ingress.annotations.clear();
        ingress.class = Some("bar".to_string());
        let ingresses = vec![ingress];
        assert_eq!(class_filter(&ingresses, &["bar".to_string()]).len(), 1);
    }

    #[test]
    fn validity_filter() {
        let ok_hostname = generic_ingress("app.com", "foo.com");
        let ok_ip = generic_ingress("app.com", "127.0.0.1");
        let no_host = generic_ingress("", "foo.com");
        let no_lb = generic_ingress("app.com", "");
        assert_eq!(valid_ingress_filter(vec![&ok_hostname]).len(), 1);
        assert_eq!(valid_ingress_filter(vec![&ok_ip]).len(), 1);
        assert_eq!(valid_ingress_filter(vec![&no_host]).len(), 0);
        assert_eq!(valid_ingress_filter(vec![&no_lb]).len(), 0);
    }

    #[test]
    fn ip_upstreams_are_kept_verbatim() {
        let ingress = generic_ingress("app.com", "127.0.0.1");
        let config = translate(&[&ingress]);
        assert_eq!(config.clusters[0].hosts[0].host, "127.0.0.1");
    }

    #[test]
    fn host_match_wildcard_rules() {
        let matching = [
            ("*.a.b", "*.a.b"),
            ("a.a.b", "a.a.b"),
            ("*.a.b", "a.a.b"),
        ];
        let non_matching = [
            ("*.a.b", "a.b"),
            ("a.a.b", "*.a.b"),
            ("*.a.b", "a.a.a.b"),
            ("*.a.a.b", "a.a.b"),
            ("", "a.b"),
            ("a.b", ""),
        ];
        for (pattern, host) in matching {
            assert!(host_match(pattern, host), "{pattern} should match {host}");
        }
        for (pattern, host) in non_matching {
            assert!(
                !host_match(pattern, host),
                "{pattern} should not match {host}"
            );
        }
    }

    #[test]
    fn maintenance_endpoints_are_excluded_when_an_active_contributor_exists() {
        let mut maint = generic_ingress("h", "ma");
        maint.maintenance = true;
        maint.name = "a".to_string();
        let mut active = generic_ingress("h", "mb");
        active.name = "b".to_string();

        let config = translate(&[&maint, &active]);
        let hosts: Vec<_> = config.clusters[0]
            .hosts
            .iter()
            .map(|h| h.host.as_str())
            .collect();
        assert_eq!(hosts, ["mb"]);
    }

    #[test]
    fn sole_maintenance_contributor_keeps_serving() {
        let mut maint = generic_ingress("h", "ma");
        maint.maintenance = true;
        let config = translate(&[&maint]);
        let hosts: Vec<_> = config.clusters[0]
            .hosts
            .iter()
            .map(|h| h.host.as_str())
            .collect();
        assert_eq!(hosts, ["ma"]);
    }

    #[test]
    fn weight_annotation_sets_endpoint_weight() {
        let mut ingress = generic_ingress("app.com", "lb.com");
        ingress
            .annotations
            .insert(ANNOTATION_WEIGHT.to_string(), "7".to_string());
        let config = translate(&[&ingress]);
        assert_eq!(config.clusters[0].hosts[0].weight, 7);
    }

    #[test]
    fn weight_zero_drops_the_endpoint() {
        let mut weighted = generic_ingress("app.com", "lb.com");
        weighted
            .annotations
            .insert(ANNOTATION_WEIGHT.to_string(), "0".to_string());
        // sole contributor: the whole host disappears
        let config = translate(&[&weighted]);
        assert!(config.clusters.is_empty());
        assert!(config.virtual_hosts.is_empty());
    }

    #[test]
    fn unparseable_weight_defaults_to_one() {
        let mut ingress = generic_ingress("app.com", "lb.com");
        ingress
            .annotations
            .insert(ANNOTATION_WEIGHT.to_string(), "lots".to_string());
        let config = translate(&[&ingress]);
        assert_eq!(config.clusters[0].hosts[0].weight, 1);
    }

    #[test]
    fn timeout_annotation_sets_all_three() {
        let mut ingress = generic_ingress("app.com", "lb.com");
        ingress
            .annotations
            .insert(ANNOTATION_TIMEOUT.to_string(), "42s".to_string());
        let config = translate(&[&ingress]);
        assert_eq!(config.clusters[0].timeout, Duration::from_secs(42));
        assert_eq!(config.virtual_hosts[0].timeout, Duration::from_secs(42));
        assert_eq!(
            config.virtual_hosts[0].per_try_timeout,
            Duration::from_secs(42)
        );
    }

    #[test]
    fn scoped_timeout_annotations_override_individually() {
        let mut ingress = generic_ingress("app.com", "lb.com");
        ingress
            .annotations
            .insert(ANNOTATION_CLUSTER_TIMEOUT.to_string(), "7s".to_string());
        ingress
            .annotations
            .insert(ANNOTATION_ROUTE_TIMEOUT.to_string(), "8s".to_string());
        ingress
            .annotations
            .insert(ANNOTATION_PER_TRY_TIMEOUT.to_string(), "9s".to_string());
        let config = translate(&[&ingress]);
        assert_eq!(config.clusters[0].timeout, Duration::from_secs(7));
        assert_eq!(config.virtual_hosts[0].timeout, Duration::from_secs(8));
        assert_eq!(
            config.virtual_hosts[0].per_try_timeout,
            Duration::from_secs(9)
        );
    }

    #[test]
    fn malformed_timeout_annotation_is_ignored() {
        let mut ingress = generic_ingress("app.com", "lb.com");
        ingress
            .annotations
            .insert(ANNOTATION_TIMEOUT.to_string(), "soon".to_string());
        let config = translate(&[&ingress]);
        assert_eq!(config.clusters[0].timeout, DefaultTimeouts::default().cluster);
    }

    #[test]
    fn conflicting_scalars_resolve_by_namespace_name_order() {
        let mut first = generic_ingress("app.com", "a.com");
        first.namespace = "aaa".to_string();
        first.name = "x".to_string();
        first
            .annotations
            .insert(ANNOTATION_ROUTE_TIMEOUT.to_string(), "10s".to_string());

        let mut last = generic_ingress("app.com", "b.com");
        last.namespace = "zzz".to_string();
        last.name = "y".to_string();
        last.annotations
            .insert(ANNOTATION_ROUTE_TIMEOUT.to_string(), "20s".to_string());

        // encounter order must not matter
        let config = translate(&[&last, &first]);
        assert_eq!(config.virtual_hosts[0].timeout, Duration::from_secs(20));
        let config = translate(&[&first, &last]);
        assert_eq!(config.virtual_hosts[0].timeout, Duration::from_secs(20));
    }

    #[test]
    fn retry_on_annotation_is_validated() {
        let mut ok = generic_ingress("app.com", "lb.com");
        ok.annotations.insert(
            ANNOTATION_RETRY_ON.to_string(),
            "gateway-error,reset".to_string(),
        );
        let config = translate(&[&ok]);
        assert_eq!(
            config.virtual_hosts[0].retry_on.as_deref(),
            Some("gateway-error,reset")
        );

        let mut bad = generic_ingress("app.com", "lb.com");
        bad.annotations
            .insert(ANNOTATION_RETRY_ON.to_string(), "flaky".to_string());
        let config = translate(&[&bad]);
        assert_eq!(config.virtual_hosts[0].retry_on, None);
    }

    #[test]
    fn upstream_http_version_annotation() {
        let mut legacy = generic_ingress("app.com", "lb.com");
        legacy.annotations.insert(
            ANNOTATION_UPSTREAM_HTTP_VERSION.to_string(),
            "1.1".to_string(),
        );
        let config = translate(&[&legacy]);
        assert_eq!(config.clusters[0].http_version, UpstreamHttpVersion::Http1);

        let mut other = generic_ingress("app.com", "lb.com");
        other.annotations.insert(
            ANNOTATION_UPSTREAM_HTTP_VERSION.to_string(),
            "3".to_string(),
        );
        let config = translate(&[&other]);
        assert_eq!(config.clusters[0].http_version, UpstreamHttpVersion::Http2);
    }

    #[test]
    fn wildcard_healthcheck_host_must_be_a_subdomain() {
        let mut ingress = generic_ingress("*.api.io", "lb.com");
        ingress.annotations.insert(
            ANNOTATION_HEALTHCHECK_HOST.to_string(),
            "foo.api.io".to_string(),
        );
        ingress
            .annotations
            .insert(ANNOTATION_HEALTHCHECK_PATH.to_string(), "/h".to_string());
        let config = translate(&[&ingress]);
        assert_eq!(config.clusters[0].health_check_host, "foo.api.io");
        assert_eq!(config.clusters[0].health_check_path, "/h");

        let mut foreign = generic_ingress("*.api.io", "lb.com");
        foreign.annotations.insert(
            ANNOTATION_HEALTHCHECK_HOST.to_string(),
            "other.com".to_string(),
        );
        let config = translate(&[&foreign]);
        assert_eq!(config.clusters[0].health_check_host, "*.api.io");
    }

    #[test]
    fn tls_secret_selection_prefers_own_namespace_and_first_match() {
        let secrets = vec![
            TlsSecret {
                namespace: "ns1".to_string(),
                name: "foo".to_string(),
                cert: P256_CRT.to_string(),
                key: P256_KEY.to_string(),
            },
            TlsSecret {
                namespace: "ns2".to_string(),
                name: "foo".to_string(),
                cert: "other".to_string(),
                key: "other".to_string(),
            },
        ];
        let mut ingress = generic_ingress("foo.app.com", "lb.com");
        ingress.namespace = "ns1".to_string();
        ingress.tls = vec![yggdrasil_core::TlsEntry {
            host: "*.app.com".to_string(),
            secret_name: "foo".to_string(),
        }];

        let config = translate_ingresses(
            &[&ingress],
            true,
            &secrets,
            DefaultTimeouts::default(),
            "/var/log/envoy",
        );
        assert_eq!(config.virtual_hosts[0].tls_cert.as_deref(), Some(P256_CRT));
        assert_eq!(config.virtual_hosts[0].tls_key.as_deref(), Some(P256_KEY));
    }

    #[test]
    fn missing_or_invalid_secret_leaves_vhost_plain() {
        let mut ingress = generic_ingress("foo.app.com", "lb.com");
        ingress.namespace = "ns1".to_string();
        ingress.tls = vec![yggdrasil_core::TlsEntry {
            host: "foo.app.com".to_string(),
            secret_name: "nope".to_string(),
        }];
        let config = translate_ingresses(
            &[&ingress],
            true,
            &[],
            DefaultTimeouts::default(),
            "/var/log/envoy",
        );
        assert_eq!(config.virtual_hosts[0].tls_cert, None);

        // present but garbage: reported, not attached
        let bad = secret("blap", "blep");
        let mut ingress = generic_ingress("foo.app.com", "lb.com");
        ingress.namespace = "ns".to_string();
        ingress.tls = vec![yggdrasil_core::TlsEntry {
            host: "foo.app.com".to_string(),
            secret_name: "sec".to_string(),
        }];
        let config = translate_ingresses(
            &[&ingress],
            true,
            &[bad],
            DefaultTimeouts::default(),
            "/var/log/envoy",
        );
        assert_eq!(config.virtual_hosts[0].tls_cert, None);
    }
}

use crate::Settings;
use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use yggdrasil_core::{DefaultTimeouts, GoDuration, RetryPolicy};
use yggdrasil_envoy as envoy;
use yggdrasil_k8s::SourceCluster;

const DEFAULT_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_HEALTH_ADDRESS: &str = "0.0.0.0:8081";
const DEFAULT_UPSTREAM_PORT: u32 = 443;
const DEFAULT_ENVOY_PORT: u32 = 10000;
const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
const DEFAULT_RETRY_ON: &str = "5xx";
const DEFAULT_ACCESS_LOG_DIR: &str = "/var/log/envoy";
const DEFAULT_GRPC_TIMEOUT: Duration = Duration::from_millis(200);
const DEFAULT_MAX_REQUEST_BYTES: u32 = 8192;

/// Command-line surface. Every option can also come from the `--config`
/// file; explicit flags win.
#[derive(Debug, Parser)]
#[clap(
    name = "yggdrasil",
    about = "An Envoy control plane that aggregates ingress objects across Kubernetes clusters"
)]
pub struct Args {
    /// Config file path.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Control plane (xDS) listen address.
    #[clap(long)]
    address: Option<SocketAddr>,

    /// Health and metrics listen address.
    #[clap(long)]
    health_address: Option<SocketAddr>,

    /// Envoy node name served by this control plane.
    #[clap(long)]
    node_name: Option<String>,

    /// Certificate file for the single default certificate.
    #[clap(long)]
    cert: Option<PathBuf>,

    /// Key file for the single default certificate.
    #[clap(long)]
    key: Option<PathBuf>,

    /// Trusted CA file for upstream TLS.
    #[clap(long)]
    ca: Option<String>,

    /// Ingress classes to accept.
    #[clap(long, value_delimiter = ',')]
    ingress_classes: Vec<String>,

    /// Paths to kubeconfig files naming additional source clusters.
    #[clap(long = "kube-config")]
    kube_config: Vec<PathBuf>,

    /// Log at debug level.
    #[clap(long)]
    debug: bool,

    /// Port used to connect to the upstream ingresses.
    #[clap(long)]
    upstream_port: Option<u32>,

    /// Addresses the proxy listener binds; the first is primary.
    #[clap(long = "envoy-listener-ipv4-address", value_delimiter = ',')]
    envoy_listener_ipv4_address: Vec<String>,

    /// Port the proxy listener binds.
    #[clap(long)]
    envoy_port: Option<u32>,

    /// Maximal percentage of hosts ejected via outlier detection; negative
    /// disables outlier detection.
    #[clap(long)]
    max_ejection_percentage: Option<i32>,

    /// Number of host selection retry attempts; negative disables the retry
    /// host predicate.
    #[clap(long)]
    host_selection_retry_attempts: Option<i64>,

    /// Default comma-separated list of retry policies.
    #[clap(long)]
    retry_on: Option<String>,

    /// Directory the proxy writes access logs into.
    #[clap(long)]
    access_log_dir: Option<String>,

    #[clap(long)]
    upstream_healthcheck_interval: Option<GoDurationArg>,

    #[clap(long)]
    upstream_healthcheck_timeout: Option<GoDurationArg>,

    /// Successful checks before a backend is considered healthy.
    #[clap(long)]
    upstream_healthcheck_healthy: Option<u32>,

    /// Failed checks before a backend is considered unhealthy.
    #[clap(long)]
    upstream_healthcheck_unhealthy: Option<u32>,

    /// Populate X-Forwarded-For with the peer address; set when running as
    /// an edge proxy.
    #[clap(long)]
    use_remote_address: bool,

    /// Strip any port from the Host header before route matching.
    #[clap(long)]
    strip_matching_host_port: bool,

    /// Name of the gRPC access log.
    #[clap(long)]
    http_grpc_logger_name: Option<String>,

    /// Upstream gRPC cluster receiving access logs.
    #[clap(long)]
    http_grpc_logger_cluster: Option<String>,

    #[clap(long)]
    http_grpc_logger_timeout: Option<GoDurationArg>,

    #[clap(long, value_delimiter = ',')]
    http_grpc_logger_request_headers: Vec<String>,

    #[clap(long, value_delimiter = ',')]
    http_grpc_logger_response_headers: Vec<String>,

    /// Upstream gRPC cluster performing external authorization.
    #[clap(long)]
    http_ext_authz_cluster: Option<String>,

    #[clap(long)]
    http_ext_authz_timeout: Option<GoDurationArg>,

    /// Maximum request body size buffered for the authorization request.
    #[clap(long)]
    http_ext_authz_max_request_bytes: Option<u32>,

    /// Buffer the body until max-request-bytes is reached.
    #[clap(long)]
    http_ext_authz_allow_partial_message: Option<bool>,

    /// Send the body as raw bytes instead of UTF-8.
    #[clap(long)]
    http_ext_authz_pack_as_bytes: Option<bool>,

    /// Allow requests through when the authorization service fails.
    #[clap(long)]
    http_ext_authz_failure_mode_allow: Option<bool>,

    /// ALPN protocols advertised by the listener.
    #[clap(long, value_delimiter = ',')]
    alpn_protocols: Vec<String>,

    /// Watch TLS secrets and serve their material per host.
    #[clap(long)]
    sync_secrets: bool,

    /// Tracing provider ("zipkin" or empty).
    #[clap(long)]
    tracing_provider: Option<String>,
}

// clap needs FromStr; GoDuration already parses the Go syntax.
type GoDurationArg = GoDuration;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileConfig {
    ingress_classes: Vec<String>,
    node_name: Option<String>,
    clusters: Vec<SourceCluster>,
    certificates: Vec<FileCertificate>,
    trust_ca: Option<String>,
    upstream_port: Option<u32>,
    envoy_listener_ipv4_address: Option<OneOrMany>,
    envoy_port: Option<u32>,
    max_ejection_percentage: Option<i32>,
    host_selection_retry_attempts: Option<i64>,
    upstream_health_check: FileHealthCheck,
    use_remote_address: Option<bool>,
    strip_matching_host_port: Option<bool>,
    http_ext_authz: FileExtAuthz,
    http_grpc_logger: FileGrpcLogger,
    alpn_protocols: Vec<String>,
    retry_on: Option<String>,
    sync_secrets: Option<bool>,
    tracing_provider: Option<String>,
    access_log_dir: Option<String>,
    default_timeouts: FileTimeouts,
}

/// A static certificate as configured: host patterns plus file paths.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileCertificate {
    hosts: Vec<String>,
    cert: PathBuf,
    key: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(addr) => vec![addr],
            OneOrMany::Many(addrs) => addrs,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileHealthCheck {
    interval: Option<GoDuration>,
    timeout: Option<GoDuration>,
    healthy_threshold: Option<u32>,
    unhealthy_threshold: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileExtAuthz {
    cluster: Option<String>,
    timeout: Option<GoDuration>,
    max_request_bytes: Option<u32>,
    allow_partial_message: Option<bool>,
    pack_as_bytes: Option<bool>,
    failure_mode_allow: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileGrpcLogger {
    name: Option<String>,
    cluster: Option<String>,
    timeout: Option<GoDuration>,
    request_headers: Vec<String>,
    response_headers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileTimeouts {
    cluster: Option<GoDuration>,
    route: Option<GoDuration>,
    per_try: Option<GoDuration>,
}

impl Args {
    pub fn init_tracing(&self) {
        let default = if self.debug { "yggdrasil=debug,info" } else { "info" };
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Merges flags over the config file and validates everything that is
    /// fatal at startup: node name, retry-on policy, certificate material.
    pub fn resolve(self) -> Result<Settings> {
        let file = match &self.config {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_json::from_slice::<FileConfig>(&bytes)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => FileConfig::default(),
        };

        let node_name = self
            .node_name
            .or(file.node_name)
            .filter(|n| !n.is_empty())
            .context("node name must be set")?;

        let retry_on = self
            .retry_on
            .or(file.retry_on)
            .unwrap_or_else(|| DEFAULT_RETRY_ON.to_string());
        retry_on
            .parse::<RetryPolicy>()
            .with_context(|| format!("invalid retry-on parameter {retry_on:?}"))?;

        let ingress_classes = if self.ingress_classes.is_empty() {
            file.ingress_classes
        } else {
            self.ingress_classes
        };

        let clusters = file.clusters;
        if clusters.is_empty() && self.kube_config.is_empty() {
            bail!("no source clusters configured: set clusters[] in the config file or pass --kube-config");
        }
        let kubeconfig_sources = self.kube_config;

        let certificates = load_certificates(file.certificates, self.cert, self.key)?;

        let listen_addresses = if self.envoy_listener_ipv4_address.is_empty() {
            file.envoy_listener_ipv4_address
                .map(OneOrMany::into_vec)
                .filter(|addrs| !addrs.is_empty())
                .unwrap_or_else(|| vec![DEFAULT_LISTEN_ADDRESS.to_string()])
        } else {
            self.envoy_listener_ipv4_address
        };

        let upstream_health_check = envoy::UpstreamHealthCheck {
            interval: self
                .upstream_healthcheck_interval
                .or(file.upstream_health_check.interval)
                .map(Duration::from)
                .unwrap_or(Duration::from_secs(10)),
            timeout: self
                .upstream_healthcheck_timeout
                .or(file.upstream_health_check.timeout)
                .map(Duration::from)
                .unwrap_or(Duration::from_secs(5)),
            healthy_threshold: self
                .upstream_healthcheck_healthy
                .or(file.upstream_health_check.healthy_threshold)
                .unwrap_or(3),
            unhealthy_threshold: self
                .upstream_healthcheck_unhealthy
                .or(file.upstream_health_check.unhealthy_threshold)
                .unwrap_or(3),
        };

        let ext_authz_cluster = self
            .http_ext_authz_cluster
            .or(file.http_ext_authz.cluster)
            .filter(|c| !c.is_empty());
        let http_ext_authz = ext_authz_cluster.map(|cluster| envoy::HttpExtAuthz {
            cluster,
            timeout: self
                .http_ext_authz_timeout
                .or(file.http_ext_authz.timeout)
                .map(Duration::from)
                .unwrap_or(DEFAULT_GRPC_TIMEOUT),
            max_request_bytes: self
                .http_ext_authz_max_request_bytes
                .or(file.http_ext_authz.max_request_bytes)
                .unwrap_or(DEFAULT_MAX_REQUEST_BYTES),
            allow_partial_message: self
                .http_ext_authz_allow_partial_message
                .or(file.http_ext_authz.allow_partial_message)
                .unwrap_or(true),
            pack_as_bytes: self
                .http_ext_authz_pack_as_bytes
                .or(file.http_ext_authz.pack_as_bytes)
                .unwrap_or(false),
            failure_mode_allow: self
                .http_ext_authz_failure_mode_allow
                .or(file.http_ext_authz.failure_mode_allow)
                .unwrap_or(true),
        });

        let grpc_logger_cluster = self
            .http_grpc_logger_cluster
            .or(file.http_grpc_logger.cluster)
            .filter(|c| !c.is_empty());
        let http_grpc_logger = grpc_logger_cluster.map(|cluster| envoy::HttpGrpcLogger {
            cluster,
            name: self
                .http_grpc_logger_name
                .or(file.http_grpc_logger.name)
                .unwrap_or_default(),
            timeout: self
                .http_grpc_logger_timeout
                .or(file.http_grpc_logger.timeout)
                .map(Duration::from)
                .unwrap_or(DEFAULT_GRPC_TIMEOUT),
            request_headers: if self.http_grpc_logger_request_headers.is_empty() {
                file.http_grpc_logger.request_headers
            } else {
                self.http_grpc_logger_request_headers
            },
            response_headers: if self.http_grpc_logger_response_headers.is_empty() {
                file.http_grpc_logger.response_headers
            } else {
                self.http_grpc_logger_response_headers
            },
        });

        let tracing_provider = match self
            .tracing_provider
            .or(file.tracing_provider)
            .as_deref()
            .unwrap_or("")
        {
            "" => None,
            "zipkin" => Some(envoy::TracingProvider::Zipkin),
            other => bail!("unknown tracing provider {other:?}"),
        };

        let defaults = DefaultTimeouts::default();
        let default_timeouts = DefaultTimeouts {
            cluster: file
                .default_timeouts
                .cluster
                .map(Duration::from)
                .unwrap_or(defaults.cluster),
            route: file
                .default_timeouts
                .route
                .map(Duration::from)
                .unwrap_or(defaults.route),
            per_try: file
                .default_timeouts
                .per_try
                .map(Duration::from)
                .unwrap_or(defaults.per_try),
        };

        let sync_secrets = self.sync_secrets || file.sync_secrets.unwrap_or(false);

        let options = envoy::Options {
            node_id: node_name.clone(),
            ingress_classes: ingress_classes.clone(),
            certificates,
            trust_ca: self.ca.or(file.trust_ca).filter(|ca| !ca.is_empty()),
            access_log_dir: self
                .access_log_dir
                .or(file.access_log_dir)
                .unwrap_or_else(|| DEFAULT_ACCESS_LOG_DIR.to_string()),
            sync_secrets,
            upstream_port: self
                .upstream_port
                .or(file.upstream_port)
                .unwrap_or(DEFAULT_UPSTREAM_PORT),
            listen_addresses,
            listen_port: self.envoy_port.or(file.envoy_port).unwrap_or(DEFAULT_ENVOY_PORT),
            outlier_percentage: self
                .max_ejection_percentage
                .or(file.max_ejection_percentage)
                .unwrap_or(-1),
            host_selection_retry_attempts: self
                .host_selection_retry_attempts
                .or(file.host_selection_retry_attempts)
                .unwrap_or(-1),
            upstream_health_check,
            use_remote_address: self.use_remote_address
                || file.use_remote_address.unwrap_or(false),
            strip_matching_host_port: self.strip_matching_host_port
                || file.strip_matching_host_port.unwrap_or(false),
            http_ext_authz,
            http_grpc_logger,
            default_timeouts,
            default_retry_on: retry_on,
            alpn_protocols: if self.alpn_protocols.is_empty() {
                file.alpn_protocols
            } else {
                self.alpn_protocols
            },
            tracing_provider,
        };

        Ok(Settings {
            address: self
                .address
                .unwrap_or_else(|| DEFAULT_ADDRESS.parse().expect("default address must parse")),
            health_address: self.health_address.unwrap_or_else(|| {
                DEFAULT_HEALTH_ADDRESS
                    .parse()
                    .expect("default health address must parse")
            }),
            node_name,
            ingress_classes,
            clusters,
            kubeconfig_sources,
            sync_secrets,
            options,
        })
    }
}

/// Loads the static certificates into memory. The bare `--cert`/`--key`
/// shorthand forms a single wildcard certificate; specifying only one of the
/// two is a configuration error.
fn load_certificates(
    certificates: Vec<FileCertificate>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<Vec<envoy::Certificate>> {
    let certificates = if certificates.is_empty() {
        match (cert, key) {
            (Some(cert), Some(key)) => vec![FileCertificate {
                hosts: vec!["*".to_string()],
                cert,
                key,
            }],
            (None, None) => Vec::new(),
            (Some(_), None) => {
                bail!("only 'cert' is specified; to enable TLS specify both 'cert' and 'key'")
            }
            (None, Some(_)) => {
                bail!("only 'key' is specified; to enable TLS specify both 'cert' and 'key'")
            }
        }
    } else {
        certificates
    };

    certificates
        .into_iter()
        .map(|c| {
            let cert = std::fs::read_to_string(&c.cert)
                .with_context(|| format!("failed to read {}", c.cert.display()))?;
            let key = std::fs::read_to_string(&c.key)
                .with_context(|| format!("failed to read {}", c.key.display()))?;
            Ok(envoy::Certificate {
                hosts: c.hosts,
                cert,
                key,
            })
        })
        .collect()
}

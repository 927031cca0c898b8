use crate::configurator::{Certificate, Configurator, TracingProvider};
use anyhow::Result;
use prost::Message;
use std::{collections::BTreeMap, time::Duration};
use tracing::{info, warn};
use xds_api::pb::envoy::config::{
    accesslog::v3::{access_log, AccessLog},
    cluster::v3::{
        circuit_breakers, cluster, CircuitBreakers, Cluster as EnvoyCluster, OutlierDetection,
    },
    core::v3::{
        address, data_source, grpc_service, health_check, socket_address,
        substitution_format_string, transport_socket, Address, ApiVersion, DataSource,
        GrpcService, HealthCheck, Http1ProtocolOptions, Http2ProtocolOptions, SocketAddress,
        SubstitutionFormatString, TransportSocket,
    },
    endpoint::v3::{
        lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint as EnvoyLbEndpoint,
        LocalityLbEndpoints,
    },
    listener::v3::{
        filter, listener_filter, AdditionalAddress, Filter, FilterChain, FilterChainMatch,
        Listener, ListenerFilter,
    },
    route::v3::{
        header_matcher, retry_policy, route, route_action, route_match, HeaderMatcher,
        RetryPolicy, Route, RouteAction, RouteConfiguration, RouteMatch,
        VirtualHost as EnvoyVirtualHost,
    },
    trace::v3 as envoy_trace,
};
use xds_api::pb::envoy::extensions::{
    access_loggers::{
        file::v3::{file_access_log, FileAccessLog},
        grpc::v3::{CommonGrpcAccessLogConfig, HttpGrpcAccessLogConfig},
    },
    filters::{
        http::{
            ext_authz::v3::{ext_authz, BufferSettings, ExtAuthz},
            health_check::v3::HealthCheck as HealthCheckFilter,
            router::v3::Router,
        },
        listener::tls_inspector::v3::TlsInspector,
        network::http_connection_manager::v3::{
            http_connection_manager, http_filter, HttpConnectionManager, HttpFilter,
        },
    },
    transport_sockets::tls::v3::{
        common_tls_context, CertificateValidationContext, CommonTlsContext,
        DownstreamTlsContext, TlsCertificate, UpstreamTlsContext,
    },
    upstreams::http::v3::{http_protocol_options, HttpProtocolOptions},
};
use xds_api::pb::envoy::r#type::matcher::v3::{string_matcher, StringMatcher};
use xds_api::pb::google::protobuf::{Any, BoolValue, Duration as PbDuration, UInt32Value};
use yggdrasil_core::{Cluster, ProxyConfig, UpstreamHttpVersion, VirtualHost};
use yggdrasil_xds::ResourceType;

const STATUS_PATH: &str = "/yggdrasil/status";
const ACCESS_LOG_FILE: &str = "access.log";

const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const HEALTH_CHECK_FILTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.health_check.v3.HealthCheck";
const EXT_AUTHZ_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthz";
const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
const DOWNSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
const UPSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
const FILE_ACCESS_LOG_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.access_loggers.file.v3.FileAccessLog";
const HTTP_GRPC_ACCESS_LOG_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.access_loggers.grpc.v3.HttpGrpcAccessLogConfig";
const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const ZIPKIN_TYPE_URL: &str = "type.googleapis.com/envoy.config.trace.v3.ZipkinConfig";

// Fixed circuit-breaker and HTTP/2 bounds carried on every upstream cluster.
const MAX_CONNECTIONS: u32 = 1024;
const MAX_PENDING_REQUESTS: u32 = 1024;
const MAX_REQUESTS: u32 = 1024;
const MAX_RETRIES: u32 = 3;
const H2_MAX_CONCURRENT_STREAMS: u32 = 128;

fn pack<M: Message>(type_url: &str, message: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

fn pb_duration(d: Duration) -> PbDuration {
    PbDuration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

fn json_access_log_format() -> String {
    let format: BTreeMap<&str, &str> = [
        ("start_time", "%START_TIME(%s.%3f)%"),
        ("bytes_received", "%BYTES_RECEIVED%"),
        ("protocol", "%PROTOCOL%"),
        ("response_code", "%RESPONSE_CODE%"),
        ("bytes_sent", "%BYTES_SENT%"),
        ("duration", "%DURATION%"),
        ("response_flags", "%RESPONSE_FLAGS%"),
        ("upstream_host", "%UPSTREAM_HOST%"),
        ("upstream_cluster", "%UPSTREAM_CLUSTER%"),
        ("upstream_local_address", "%UPSTREAM_LOCAL_ADDRESS%"),
        ("downstream_remote_address", "%DOWNSTREAM_REMOTE_ADDRESS%"),
        ("downstream_local_address", "%DOWNSTREAM_LOCAL_ADDRESS%"),
        ("request_method", "%REQ(:METHOD)%"),
        ("request_path", "%REQ(X-ENVOY-ORIGINAL-PATH?:PATH)%"),
        ("upstream_service_time", "%RESP(X-ENVOY-UPSTREAM-SERVICE-TIME)%"),
        ("forwarded_for", "%REQ(X-FORWARDED-FOR)%"),
        ("user_agent", "%REQ(USER-AGENT)%"),
        ("request_id", "%REQ(X-REQUEST-ID)%"),
    ]
    .into_iter()
    .collect();
    let mut line =
        serde_json::to_string(&format).expect("a map of string literals must serialize");
    line.push('\n');
    line
}

fn make_address(host: &str, port: u32) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

fn make_listener(filter_chains: Vec<FilterChain>, addresses: &[String], port: u32) -> Listener {
    let mut addresses = addresses.iter();
    let primary = addresses.next().map(|a| make_address(a, port));
    Listener {
        name: "listener_0".to_string(),
        address: primary,
        additional_addresses: addresses
            .map(|a| AdditionalAddress {
                address: Some(make_address(a, port)),
                ..Default::default()
            })
            .collect(),
        // The inspector makes the connection's SNI available before a filter
        // chain is selected.
        listener_filters: vec![ListenerFilter {
            name: "envoy.filters.listener.tls_inspector".to_string(),
            config_type: Some(listener_filter::ConfigType::TypedConfig(pack(
                TLS_INSPECTOR_TYPE_URL,
                &TlsInspector::default(),
            ))),
            ..Default::default()
        }],
        filter_chains,
        ..Default::default()
    }
}

impl Configurator {
    pub(crate) fn generate_listeners(&self, config: &ProxyConfig) -> Result<Vec<Any>> {
        let filter_chains = if self.options.sync_secrets {
            self.dynamic_tls_filter_chains(config)
        } else if !self.options.certificates.is_empty() {
            self.static_tls_filter_chains(config)
        } else {
            self.http_filter_chain(config)
        };
        let listener = make_listener(
            filter_chains,
            &self.options.listen_addresses,
            self.options.listen_port,
        );
        Ok(vec![pack(ResourceType::Listener.type_url(), &listener)])
    }

    pub(crate) fn generate_clusters(&self, config: &ProxyConfig) -> Vec<Any> {
        config
            .clusters
            .iter()
            .map(|c| pack(ResourceType::Cluster.type_url(), &self.make_cluster(c)))
            .collect()
    }

    /// Plain HTTP: one filter chain, no SNI match, no TLS.
    fn http_filter_chain(&self, config: &ProxyConfig) -> Vec<FilterChain> {
        let vhosts = config
            .virtual_hosts
            .iter()
            .map(|v| self.make_virtual_host(v))
            .collect();
        let hcm = self.make_connection_manager(vhosts, &config.access_log_dir);
        vec![FilterChain {
            filters: vec![Filter {
                name: "envoy.filters.network.http_connection_manager".to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(pack(HCM_TYPE_URL, &hcm))),
            }],
            ..Default::default()
        }]
    }

    /// Static TLS: one chain per configured certificate, carrying the
    /// virtual hosts that certificate covers. A virtual host may appear in
    /// several chains.
    fn static_tls_filter_chains(&self, config: &ProxyConfig) -> Vec<FilterChain> {
        let mut per_cert: Vec<Vec<EnvoyVirtualHost>> =
            vec![Vec::new(); self.options.certificates.len()];
        for vhost in &config.virtual_hosts {
            let matched = self.match_certificates(vhost);
            if matched.is_empty() {
                warn!(host = %vhost.host, "no certificate matches virtual host");
                continue;
            }
            for idx in matched {
                per_cert[idx].push(self.make_virtual_host(vhost));
            }
        }

        self.options
            .certificates
            .iter()
            .zip(per_cert)
            .filter(|(_, vhosts)| !vhosts.is_empty())
            .map(|(certificate, vhosts)| {
                self.make_filter_chain(certificate, vhosts, &config.access_log_dir)
            })
            .collect()
    }

    /// Dynamic TLS: one chain per virtual host carrying synced material,
    /// plus a default chain bound to the single configured certificate (when
    /// exactly one exists) carrying every virtual host as fallback.
    fn dynamic_tls_filter_chains(&self, config: &ProxyConfig) -> Vec<FilterChain> {
        let mut chains = Vec::new();
        let mut all_vhosts = Vec::new();

        for vhost in &config.virtual_hosts {
            let envoy_vhost = self.make_virtual_host(vhost);
            all_vhosts.push(envoy_vhost.clone());

            let (Some(cert), Some(key)) = (&vhost.tls_cert, &vhost.tls_key) else {
                if self.options.certificates.is_empty() {
                    warn!(host = %vhost.host, "skipping vhost because of no certificate");
                } else {
                    info!(host = %vhost.host, "using default certificate");
                }
                continue;
            };
            let certificate = Certificate {
                hosts: vec![vhost.host.clone()],
                cert: cert.clone(),
                key: key.clone(),
            };
            chains.push(self.make_filter_chain(
                &certificate,
                vec![envoy_vhost],
                &config.access_log_dir,
            ));
        }

        if let [default] = self.options.certificates.as_slice() {
            let default_cert = Certificate {
                hosts: vec!["*".to_string()],
                cert: default.cert.clone(),
                key: default.key.clone(),
            };
            chains.push(self.make_filter_chain(
                &default_cert,
                all_vhosts,
                &config.access_log_dir,
            ));
        }

        chains
    }

    fn make_virtual_host(&self, vhost: &VirtualHost) -> EnvoyVirtualHost {
        let mut retry = RetryPolicy {
            retry_on: vhost
                .retry_on
                .clone()
                .unwrap_or_else(|| self.options.default_retry_on.clone()),
            per_try_timeout: Some(pb_duration(vhost.per_try_timeout)),
            ..Default::default()
        };
        if self.options.host_selection_retry_attempts >= 0 {
            retry.retry_host_predicate = vec![retry_policy::RetryHostPredicate {
                name: "envoy.retry_host_predicates.previous_hosts".to_string(),
                ..Default::default()
            }];
            retry.host_selection_retry_max_attempts = self.options.host_selection_retry_attempts;
        }

        EnvoyVirtualHost {
            name: vhost.host.clone(),
            domains: vec![vhost.host.clone()],
            routes: vec![Route {
                r#match: Some(RouteMatch {
                    path_specifier: Some(route_match::PathSpecifier::Prefix("/".to_string())),
                    ..Default::default()
                }),
                action: Some(route::Action::Route(RouteAction {
                    cluster_specifier: Some(route_action::ClusterSpecifier::Cluster(
                        vhost.upstream_cluster.clone(),
                    )),
                    timeout: Some(pb_duration(vhost.timeout)),
                    retry_policy: Some(retry),
                    ..Default::default()
                })),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn make_connection_manager(
        &self,
        virtual_hosts: Vec<EnvoyVirtualHost>,
        access_log_dir: &str,
    ) -> HttpConnectionManager {
        let mut hcm = HttpConnectionManager {
            codec_type: http_connection_manager::CodecType::Auto as i32,
            stat_prefix: "ingress_http".to_string(),
            http_filters: self.http_filters(),
            upgrade_configs: vec![http_connection_manager::UpgradeConfig {
                upgrade_type: "websocket".to_string(),
                ..Default::default()
            }],
            route_specifier: Some(http_connection_manager::RouteSpecifier::RouteConfig(
                RouteConfiguration {
                    name: "local_route".to_string(),
                    virtual_hosts,
                    ..Default::default()
                },
            )),
            access_log: self.access_logs(access_log_dir),
            use_remote_address: Some(BoolValue { value: self.options.use_remote_address }),
            strip_matching_host_port: self.options.strip_matching_host_port,
            ..Default::default()
        };

        if self.options.tracing_provider == Some(TracingProvider::Zipkin) {
            let zipkin = envoy_trace::ZipkinConfig {
                collector_cluster: "zipkin".to_string(),
                collector_endpoint: "/api/v2/spans".to_string(),
                collector_endpoint_version:
                    envoy_trace::zipkin_config::CollectorEndpointVersion::HttpJson as i32,
                ..Default::default()
            };
            hcm.tracing = Some(http_connection_manager::Tracing {
                provider: Some(envoy_trace::tracing::Http {
                    name: "envoy.tracers.zipkin".to_string(),
                    config_type: Some(envoy_trace::tracing::http::ConfigType::TypedConfig(
                        pack(ZIPKIN_TYPE_URL, &zipkin),
                    )),
                }),
                ..Default::default()
            });
        }

        hcm
    }

    /// Filter ordering: the health-check interceptor first (so status probes
    /// never touch an upstream), ext-authz when configured, then the router.
    fn http_filters(&self) -> Vec<HttpFilter> {
        let mut filters = Vec::new();

        let health = HealthCheckFilter {
            pass_through_mode: Some(false),
            headers: vec![HeaderMatcher {
                name: ":path".to_string(),
                header_match_specifier: Some(
                    header_matcher::HeaderMatchSpecifier::StringMatch(StringMatcher {
                        match_pattern: Some(string_matcher::MatchPattern::Exact(
                            STATUS_PATH.to_string(),
                        )),
                        ..Default::default()
                    }),
                ),
                ..Default::default()
            }],
            ..Default::default()
        };
        filters.push(HttpFilter {
            name: "envoy.filters.http.health_check".to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(pack(
                HEALTH_CHECK_FILTER_TYPE_URL,
                &health,
            ))),
            ..Default::default()
        });

        if let Some(authz) = &self.options.http_ext_authz {
            let ext = ExtAuthz {
                transport_api_version: ApiVersion::V3 as i32,
                failure_mode_allow: authz.failure_mode_allow,
                with_request_body: Some(BufferSettings {
                    max_request_bytes: authz.max_request_bytes,
                    allow_partial_message: authz.allow_partial_message,
                    pack_as_bytes: authz.pack_as_bytes,
                }),
                services: Some(ext_authz::Services::GrpcService(GrpcService {
                    target_specifier: Some(grpc_service::TargetSpecifier::EnvoyGrpc(
                        grpc_service::EnvoyGrpc {
                            cluster_name: authz.cluster.clone(),
                            ..Default::default()
                        },
                    )),
                    timeout: Some(pb_duration(authz.timeout)),
                    ..Default::default()
                })),
                ..Default::default()
            };
            filters.push(HttpFilter {
                name: "envoy.filters.http.ext_authz".to_string(),
                config_type: Some(http_filter::ConfigType::TypedConfig(pack(
                    EXT_AUTHZ_TYPE_URL,
                    &ext,
                ))),
                ..Default::default()
            });
        }

        filters.push(HttpFilter {
            name: "envoy.filters.http.router".to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(pack(
                ROUTER_TYPE_URL,
                &Router::default(),
            ))),
            ..Default::default()
        });

        filters
    }

    fn access_logs(&self, access_log_dir: &str) -> Vec<AccessLog> {
        let path = format!(
            "{}/{}",
            access_log_dir.trim_end_matches('/'),
            ACCESS_LOG_FILE
        );
        let file = FileAccessLog {
            path,
            access_log_format: Some(file_access_log::AccessLogFormat::LogFormat(
                SubstitutionFormatString {
                    format: Some(substitution_format_string::Format::TextFormatSource(
                        DataSource {
                            specifier: Some(data_source::Specifier::InlineString(
                                json_access_log_format(),
                            )),
                            ..Default::default()
                        },
                    )),
                    ..Default::default()
                },
            )),
        };
        let mut logs = vec![AccessLog {
            name: "envoy.access_loggers.file".to_string(),
            config_type: Some(access_log::ConfigType::TypedConfig(pack(
                FILE_ACCESS_LOG_TYPE_URL,
                &file,
            ))),
            ..Default::default()
        }];

        if let Some(logger) = &self.options.http_grpc_logger {
            let grpc = HttpGrpcAccessLogConfig {
                common_config: Some(CommonGrpcAccessLogConfig {
                    log_name: logger.name.clone(),
                    transport_api_version: ApiVersion::V3 as i32,
                    grpc_service: Some(GrpcService {
                        target_specifier: Some(grpc_service::TargetSpecifier::EnvoyGrpc(
                            grpc_service::EnvoyGrpc {
                                cluster_name: logger.cluster.clone(),
                                ..Default::default()
                            },
                        )),
                        timeout: Some(pb_duration(logger.timeout)),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                additional_request_headers_to_log: logger.request_headers.clone(),
                additional_response_headers_to_log: logger.response_headers.clone(),
            };
            logs.push(AccessLog {
                name: "envoy.access_loggers.http_grpc".to_string(),
                config_type: Some(access_log::ConfigType::TypedConfig(pack(
                    HTTP_GRPC_ACCESS_LOG_TYPE_URL,
                    &grpc,
                ))),
                ..Default::default()
            });
        }

        logs
    }

    fn make_filter_chain(
        &self,
        certificate: &Certificate,
        virtual_hosts: Vec<EnvoyVirtualHost>,
        access_log_dir: &str,
    ) -> FilterChain {
        let hcm = self.make_connection_manager(virtual_hosts, access_log_dir);

        let tls = DownstreamTlsContext {
            common_tls_context: Some(CommonTlsContext {
                alpn_protocols: self.options.alpn_protocols.clone(),
                tls_certificates: vec![TlsCertificate {
                    certificate_chain: Some(DataSource {
                        specifier: Some(data_source::Specifier::InlineString(
                            certificate.cert.clone(),
                        )),
                        ..Default::default()
                    }),
                    private_key: Some(DataSource {
                        specifier: Some(data_source::Specifier::InlineString(
                            certificate.key.clone(),
                        )),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        let server_names: Vec<String> = certificate
            .hosts
            .iter()
            .filter(|host| *host != "*")
            .cloned()
            .collect();
        let filter_chain_match = (!server_names.is_empty()).then(|| FilterChainMatch {
            server_names,
            ..Default::default()
        });

        FilterChain {
            filter_chain_match,
            transport_socket: Some(TransportSocket {
                name: TLS_TRANSPORT_SOCKET.to_string(),
                config_type: Some(transport_socket::ConfigType::TypedConfig(pack(
                    DOWNSTREAM_TLS_TYPE_URL,
                    &tls,
                ))),
            }),
            filters: vec![Filter {
                name: "envoy.filters.network.http_connection_manager".to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(pack(HCM_TYPE_URL, &hcm))),
            }],
            ..Default::default()
        }
    }

    fn make_cluster(&self, cluster: &Cluster) -> EnvoyCluster {
        let endpoints = cluster
            .hosts
            .iter()
            .map(|h| EnvoyLbEndpoint {
                host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                    address: Some(make_address(&h.host, self.options.upstream_port)),
                    ..Default::default()
                })),
                load_balancing_weight: Some(UInt32Value { value: h.weight }),
                ..Default::default()
            })
            .collect();

        let protocol_config = match cluster.http_version {
            UpstreamHttpVersion::Http1 => {
                http_protocol_options::explicit_http_config::ProtocolConfig::HttpProtocolOptions(
                    Http1ProtocolOptions::default(),
                )
            }
            UpstreamHttpVersion::Http2 => {
                http_protocol_options::explicit_http_config::ProtocolConfig::Http2ProtocolOptions(
                    Http2ProtocolOptions {
                        allow_connect: true,
                        max_concurrent_streams: Some(UInt32Value { value: H2_MAX_CONCURRENT_STREAMS }),
                        ..Default::default()
                    },
                )
            }
        };
        let protocol_options = HttpProtocolOptions {
            upstream_protocol_options: Some(
                http_protocol_options::UpstreamProtocolOptions::ExplicitHttpConfig(
                    http_protocol_options::ExplicitHttpConfig {
                        protocol_config: Some(protocol_config),
                    },
                ),
            ),
            ..Default::default()
        };

        let mut envoy_cluster = EnvoyCluster {
            name: cluster.name.clone(),
            connect_timeout: Some(pb_duration(cluster.timeout)),
            cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
                cluster::DiscoveryType::StrictDns as i32,
            )),
            load_assignment: Some(ClusterLoadAssignment {
                cluster_name: cluster.name.clone(),
                endpoints: vec![LocalityLbEndpoints {
                    lb_endpoints: endpoints,
                    ..Default::default()
                }],
                ..Default::default()
            }),
            health_checks: self.make_health_checks(cluster),
            circuit_breakers: Some(CircuitBreakers {
                thresholds: vec![circuit_breakers::Thresholds {
                    max_connections: Some(UInt32Value { value: MAX_CONNECTIONS }),
                    max_pending_requests: Some(UInt32Value { value: MAX_PENDING_REQUESTS }),
                    max_requests: Some(UInt32Value { value: MAX_REQUESTS }),
                    max_retries: Some(UInt32Value { value: MAX_RETRIES }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            typed_extension_protocol_options: [(
                "envoy.extensions.upstreams.http.v3.HttpProtocolOptions".to_string(),
                pack(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &protocol_options),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        };

        if self.options.outlier_percentage >= 0 {
            envoy_cluster.outlier_detection = Some(OutlierDetection {
                max_ejection_percent: Some(UInt32Value { value: self.options.outlier_percentage as u32 }),
                ..Default::default()
            });
        }

        if let Some(ca) = &self.options.trust_ca {
            let tls = UpstreamTlsContext {
                common_tls_context: Some(CommonTlsContext {
                    validation_context_type: Some(
                        common_tls_context::ValidationContextType::ValidationContext(
                            CertificateValidationContext {
                                trusted_ca: Some(DataSource {
                                    specifier: Some(data_source::Specifier::Filename(ca.clone())),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        ),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            };
            envoy_cluster.transport_socket = Some(TransportSocket {
                name: TLS_TRANSPORT_SOCKET.to_string(),
                config_type: Some(transport_socket::ConfigType::TypedConfig(pack(
                    UPSTREAM_TLS_TYPE_URL,
                    &tls,
                ))),
            });
        }

        envoy_cluster
    }

    fn make_health_checks(&self, cluster: &Cluster) -> Vec<HealthCheck> {
        if cluster.health_check_path.is_empty() {
            return Vec::new();
        }
        let hc = &self.options.upstream_health_check;
        vec![HealthCheck {
            timeout: Some(pb_duration(hc.timeout)),
            interval: Some(pb_duration(hc.interval)),
            healthy_threshold: Some(UInt32Value { value: hc.healthy_threshold }),
            unhealthy_threshold: Some(UInt32Value { value: hc.unhealthy_threshold }),
            health_checker: Some(health_check::HealthChecker::HttpHealthCheck(
                health_check::HttpHealthCheck {
                    host: cluster.health_check_host.clone(),
                    path: cluster.health_check_path.clone(),
                    ..Default::default()
                },
            )),
            ..Default::default()
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configurator::{Options, UpstreamHealthCheck};
    use crate::metrics::Metrics;
    use prometheus_client::registry::Registry;
    use yggdrasil_core::LbEndpoint;

    fn configurator(options: Options) -> Configurator {
        Configurator::new(options, Metrics::register(&mut Registry::default()))
    }

    fn model_cluster(path: &str) -> Cluster {
        Cluster {
            name: "app_com".to_string(),
            virtual_host: "app.com".to_string(),
            health_check_path: path.to_string(),
            health_check_host: "app.com".to_string(),
            timeout: Duration::from_secs(30),
            http_version: UpstreamHttpVersion::default(),
            hosts: vec![
                LbEndpoint {
                    host: "lb-1.example.com".to_string(),
                    weight: 1,
                },
                LbEndpoint {
                    host: "lb-2.example.com".to_string(),
                    weight: 3,
                },
            ],
        }
    }

    #[test]
    fn cluster_carries_endpoints_and_weights() {
        let c = configurator(Options::default());
        let envoy_cluster = c.make_cluster(&model_cluster(""));

        assert_eq!(envoy_cluster.name, "app_com");
        let endpoints = &envoy_cluster.load_assignment.as_ref().unwrap().endpoints[0].lb_endpoints;
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[1].load_balancing_weight, Some(3));
        assert!(envoy_cluster.health_checks.is_empty());
        assert!(envoy_cluster.outlier_detection.is_none());
    }

    #[test]
    fn health_checks_appear_iff_a_path_is_set() {
        let c = configurator(Options {
            upstream_health_check: UpstreamHealthCheck {
                timeout: Duration::from_secs(5),
                interval: Duration::from_secs(10),
                healthy_threshold: 3,
                unhealthy_threshold: 2,
            },
            ..Default::default()
        });
        let envoy_cluster = c.make_cluster(&model_cluster("/healthz"));
        assert_eq!(envoy_cluster.health_checks.len(), 1);
        let hc = &envoy_cluster.health_checks[0];
        assert_eq!(hc.unhealthy_threshold, Some(2));
        match hc.health_checker.as_ref().unwrap() {
            health_check::HealthChecker::HttpHealthCheck(http) => {
                assert_eq!(http.path, "/healthz");
                assert_eq!(http.host, "app.com");
            }
            other => panic!("unexpected health checker: {other:?}"),
        }
    }

    #[test]
    fn outlier_detection_follows_the_percentage() {
        let c = configurator(Options {
            outlier_percentage: 50,
            ..Default::default()
        });
        let envoy_cluster = c.make_cluster(&model_cluster(""));
        assert_eq!(
            envoy_cluster
                .outlier_detection
                .as_ref()
                .unwrap()
                .max_ejection_percent,
            Some(50)
        );
    }

    #[test]
    fn upstream_tls_appears_with_a_trust_ca() {
        let c = configurator(Options {
            trust_ca: Some("/etc/ssl/ca.crt".to_string()),
            ..Default::default()
        });
        let envoy_cluster = c.make_cluster(&model_cluster(""));
        assert!(envoy_cluster.transport_socket.is_some());

        let c = configurator(Options::default());
        assert!(c.make_cluster(&model_cluster("")).transport_socket.is_none());
    }

    #[test]
    fn listener_carries_additional_addresses_and_tls_inspector() {
        let listener = make_listener(
            Vec::new(),
            &[
                "10.0.0.1".to_string(),
                "10.0.0.2".to_string(),
                "10.0.0.3".to_string(),
            ],
            10000,
        );
        assert!(listener.address.is_some());
        assert_eq!(listener.additional_addresses.len(), 2);
        assert_eq!(listener.listener_filters.len(), 1);
        assert_eq!(
            listener.listener_filters[0].name,
            "envoy.filters.listener.tls_inspector"
        );
    }

    #[test]
    fn router_is_the_terminal_http_filter() {
        let c = configurator(Options::default());
        let filters = c.http_filters();
        assert_eq!(filters.first().unwrap().name, "envoy.filters.http.health_check");
        assert_eq!(filters.last().unwrap().name, "envoy.filters.http.router");
        assert_eq!(filters.len(), 2);
    }

    #[test]
    fn ext_authz_sits_between_health_check_and_router() {
        let c = configurator(Options {
            http_ext_authz: Some(crate::configurator::HttpExtAuthz {
                cluster: "authz".to_string(),
                timeout: Duration::from_millis(200),
                max_request_bytes: 8192,
                allow_partial_message: true,
                pack_as_bytes: false,
                failure_mode_allow: true,
            }),
            ..Default::default()
        });
        let filters = c.http_filters();
        let names: Vec<_> = filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "envoy.filters.http.health_check",
                "envoy.filters.http.ext_authz",
                "envoy.filters.http.router",
            ]
        );
    }

    #[test]
    fn grpc_logger_adds_a_second_sink() {
        let c = configurator(Options {
            http_grpc_logger: Some(crate::configurator::HttpGrpcLogger {
                name: "http-logs".to_string(),
                cluster: "logger".to_string(),
                timeout: Duration::from_millis(200),
                request_headers: vec!["x-request-id".to_string()],
                response_headers: Vec::new(),
            }),
            ..Default::default()
        });
        let logs = c.access_logs("/var/log/envoy");
        let names: Vec<_> = logs.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(
            names,
            ["envoy.access_loggers.file", "envoy.access_loggers.http_grpc"]
        );
    }

    #[test]
    fn access_log_path_is_rooted_in_the_directory() {
        let c = configurator(Options::default());
        let logs = c.access_logs("/var/log/envoy/");
        match logs[0].config_type.as_ref().unwrap() {
            access_log::ConfigType::TypedConfig(any) => {
                let file = FileAccessLog::decode(any.value.as_slice()).unwrap();
                assert_eq!(file.path, "/var/log/envoy/access.log");
            }
        }
    }

    #[test]
    fn retry_host_predicate_is_gated_on_attempts() {
        let vhost = VirtualHost {
            host: "app.com".to_string(),
            upstream_cluster: "app_com".to_string(),
            timeout: Duration::from_secs(15),
            per_try_timeout: Duration::from_secs(5),
            tls_cert: None,
            tls_key: None,
            retry_on: None,
        };

        let c = configurator(Options::default());
        let envoy_vhost = c.make_virtual_host(&vhost);
        let action = match envoy_vhost.routes[0].action.as_ref().unwrap() {
            route::Action::Route(action) => action,
            other => panic!("unexpected action: {other:?}"),
        };
        let retry = action.retry_policy.as_ref().unwrap();
        assert_eq!(retry.retry_on, "5xx");
        assert!(retry.retry_host_predicate.is_empty());

        let c = configurator(Options {
            host_selection_retry_attempts: 3,
            ..Default::default()
        });
        let envoy_vhost = c.make_virtual_host(&vhost);
        let action = match envoy_vhost.routes[0].action.as_ref().unwrap() {
            route::Action::Route(action) => action,
            other => panic!("unexpected action: {other:?}"),
        };
        let retry = action.retry_policy.as_ref().unwrap();
        assert_eq!(retry.host_selection_retry_max_attempts, 3);
        assert_eq!(retry.retry_host_predicate.len(), 1);
    }
}

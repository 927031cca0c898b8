use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use k8s_openapi::api::networking::v1 as networking_v1;
use kube::{
    api::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use yggdrasil_core::{Ingress, TlsEntry};

/// The ingress API groups that have existed over the lifetime of the
/// resource, newest first.
///
/// A source cluster is bound to the first group it advertises; clusters of
/// very different versions can then feed the same control plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IngressApi {
    NetworkingV1,
    NetworkingV1beta1,
    ExtensionsV1beta1,
}

impl IngressApi {
    pub const PROBE_ORDER: [IngressApi; 3] = [
        IngressApi::NetworkingV1,
        IngressApi::NetworkingV1beta1,
        IngressApi::ExtensionsV1beta1,
    ];

    pub fn api_version(&self) -> &'static str {
        match self {
            IngressApi::NetworkingV1 => "networking.k8s.io/v1",
            IngressApi::NetworkingV1beta1 => "networking.k8s.io/v1beta1",
            IngressApi::ExtensionsV1beta1 => "extensions/v1beta1",
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        let (group, version) = self
            .api_version()
            .split_once('/')
            .expect("api version must be group/version");
        ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, "Ingress"))
    }

    /// Converts a raw object observed under this API group into the
    /// version-agnostic model.
    pub fn convert(
        &self,
        obj: &DynamicObject,
        maintenance: bool,
        source_cluster: &str,
    ) -> Result<Ingress> {
        let parsed = match self {
            IngressApi::NetworkingV1 => convert_networking_v1(obj)?,
            IngressApi::NetworkingV1beta1 | IngressApi::ExtensionsV1beta1 => {
                convert_legacy(obj)?
            }
        };

        Ok(Ingress {
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name: obj.metadata.name.clone().unwrap_or_default(),
            annotations: obj
                .metadata
                .annotations
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect::<HashMap<_, _>>(),
            class: parsed.class,
            rules_hosts: parsed.rules_hosts,
            upstreams: parsed.upstreams,
            tls: parsed.tls,
            maintenance,
            source_cluster: source_cluster.to_string(),
        })
    }
}

/// Binds to the first advertised API group exposing an ingresses collection.
pub async fn probe_ingress_api(client: &Client) -> Result<IngressApi> {
    for api in IngressApi::PROBE_ORDER {
        match client.list_api_group_resources(api.api_version()).await {
            Ok(resources) if resources.resources.iter().any(|r| r.kind == "Ingress") => {
                info!(api_version = api.api_version(), "bound ingress API group");
                return Ok(api);
            }
            Ok(_) => {}
            Err(error) => {
                debug!(%error, api_version = api.api_version(), "API group not served");
            }
        }
    }
    bail!("source cluster serves no known ingress API group")
}

struct ParsedSpec {
    class: Option<String>,
    rules_hosts: Vec<String>,
    upstreams: Vec<String>,
    tls: Vec<TlsEntry>,
}

fn convert_networking_v1(obj: &DynamicObject) -> Result<ParsedSpec> {
    let spec: networking_v1::IngressSpec = field(obj, "spec").context("invalid ingress spec")?;
    let status: networking_v1::IngressStatus =
        field(obj, "status").context("invalid ingress status")?;

    let rules_hosts = spec
        .rules
        .unwrap_or_default()
        .into_iter()
        .map(|rule| rule.host.unwrap_or_default())
        .collect();

    let upstreams = status
        .load_balancer
        .and_then(|lb| lb.ingress)
        .unwrap_or_default()
        .into_iter()
        .map(|lb| match lb.hostname {
            Some(hostname) if !hostname.is_empty() => hostname,
            _ => lb.ip.unwrap_or_default(),
        })
        .collect();

    let tls = spec
        .tls
        .unwrap_or_default()
        .into_iter()
        .flat_map(|t| {
            let secret_name = t.secret_name.unwrap_or_default();
            t.hosts
                .unwrap_or_default()
                .into_iter()
                .map(move |host| TlsEntry {
                    host,
                    secret_name: secret_name.clone(),
                })
        })
        .collect();

    Ok(ParsedSpec {
        class: spec.ingress_class_name,
        rules_hosts,
        upstreams,
        tls,
    })
}

// The two v1beta1 groups shipped byte-identical schemas for everything this
// control plane reads, so they share one partial deserialization.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LegacyIngressSpec {
    ingress_class_name: Option<String>,
    rules: Vec<LegacyIngressRule>,
    tls: Vec<LegacyIngressTls>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LegacyIngressRule {
    host: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LegacyIngressTls {
    hosts: Vec<String>,
    secret_name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LegacyIngressStatus {
    load_balancer: LegacyLoadBalancerStatus,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LegacyLoadBalancerStatus {
    ingress: Vec<LegacyLoadBalancerIngress>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LegacyLoadBalancerIngress {
    hostname: String,
    ip: String,
}

fn convert_legacy(obj: &DynamicObject) -> Result<ParsedSpec> {
    let spec: LegacyIngressSpec = field(obj, "spec").context("invalid ingress spec")?;
    let status: LegacyIngressStatus = field(obj, "status").context("invalid ingress status")?;

    let upstreams = status
        .load_balancer
        .ingress
        .into_iter()
        .map(|lb| {
            if lb.hostname.is_empty() {
                lb.ip
            } else {
                lb.hostname
            }
        })
        .collect();

    let tls = spec
        .tls
        .into_iter()
        .flat_map(|t| {
            t.hosts.into_iter().map(move |host| TlsEntry {
                host,
                secret_name: t.secret_name.clone(),
            })
        })
        .collect();

    Ok(ParsedSpec {
        class: spec.ingress_class_name,
        rules_hosts: spec.rules.into_iter().map(|rule| rule.host).collect(),
        upstreams,
        tls,
    })
}

fn field<T: for<'de> Deserialize<'de> + Default>(obj: &DynamicObject, name: &str) -> Result<T> {
    match obj.data.get(name) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone()).map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic_ingress(api_version: &str, class_in_spec: bool) -> DynamicObject {
        let mut spec = json!({
            "rules": [
                {"host": "foobar.io"},
                {"host": "barfoo.io"},
            ],
            "tls": [
                {"hosts": ["foobar.io", "barfoo.io"], "secretName": "tls-boofar"},
            ],
        });
        if class_in_spec {
            spec["ingressClassName"] = json!("bar");
        }
        serde_json::from_value(json!({
            "apiVersion": api_version,
            "kind": "Ingress",
            "metadata": {
                "name": "foo",
                "namespace": "bar",
                "annotations": {"foo": "bar"},
            },
            "spec": spec,
            "status": {
                "loadBalancer": {
                    "ingress": [
                        {"ip": "1.2.3.4"},
                        {"ip": "5.6.7.8"},
                    ],
                },
            },
        }))
        .unwrap()
    }

    fn assert_normalized(ingress: &Ingress) {
        assert_eq!(ingress.name, "foo");
        assert_eq!(ingress.namespace, "bar");
        assert_eq!(ingress.annotations.get("foo").map(String::as_str), Some("bar"));
        assert_eq!(ingress.rules_hosts, ["foobar.io", "barfoo.io"]);
        assert_eq!(ingress.upstreams, ["1.2.3.4", "5.6.7.8"]);
        assert_eq!(
            ingress.tls,
            [
                TlsEntry {
                    host: "foobar.io".to_string(),
                    secret_name: "tls-boofar".to_string()
                },
                TlsEntry {
                    host: "barfoo.io".to_string(),
                    secret_name: "tls-boofar".to_string()
                },
            ]
        );
    }

    #[test]
    fn all_shapes_normalize_identically() {
        let v1 = IngressApi::NetworkingV1
            .convert(&dynamic_ingress("networking.k8s.io/v1", false), false, "c1")
            .unwrap();
        let v1b1 = IngressApi::NetworkingV1beta1
            .convert(
                &dynamic_ingress("networking.k8s.io/v1beta1", false),
                false,
                "c1",
            )
            .unwrap();
        let ext = IngressApi::ExtensionsV1beta1
            .convert(&dynamic_ingress("extensions/v1beta1", false), false, "c1")
            .unwrap();

        for ingress in [&v1, &v1b1, &ext] {
            assert_normalized(ingress);
            assert_eq!(ingress.source_cluster, "c1");
            assert!(!ingress.maintenance);
        }
        assert!(v1.same_definition(&v1b1));
        assert!(v1.same_definition(&ext));
    }

    #[test]
    fn structured_class_is_carried() {
        let ingress = IngressApi::NetworkingV1
            .convert(&dynamic_ingress("networking.k8s.io/v1", true), false, "c1")
            .unwrap();
        assert_eq!(ingress.usable_class(), Some("bar"));
    }

    #[test]
    fn hostname_is_preferred_over_ip() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"name": "foo", "namespace": "bar"},
            "spec": {"rules": [{"host": "app.com"}]},
            "status": {
                "loadBalancer": {
                    "ingress": [{"hostname": "lb.example.com", "ip": "1.2.3.4"}],
                },
            },
        }))
        .unwrap();
        let ingress = IngressApi::NetworkingV1.convert(&obj, false, "c1").unwrap();
        assert_eq!(ingress.upstreams, ["lb.example.com"]);
    }

    #[test]
    fn missing_spec_and_status_are_tolerated() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"name": "foo", "namespace": "bar"},
        }))
        .unwrap();
        let ingress = IngressApi::NetworkingV1.convert(&obj, true, "c2").unwrap();
        assert!(ingress.rules_hosts.is_empty());
        assert!(ingress.upstreams.is_empty());
        assert!(ingress.maintenance);
    }

    #[test]
    fn malformed_spec_is_an_error() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"name": "foo", "namespace": "bar"},
            "spec": {"rules": "not-a-list"},
        }))
        .unwrap();
        assert!(IngressApi::NetworkingV1.convert(&obj, false, "c1").is_err());
    }
}

use ahash::AHashMap as HashMap;

/// The annotation that historically selected an ingress controller, consulted
/// before the structured `ingressClassName` field.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// An ingress normalized across the historical Kubernetes API shapes
/// (`extensions/v1beta1`, `networking.k8s.io/v1beta1`, `networking.k8s.io/v1`).
///
/// Replaced wholesale on update; never mutated in place.
#[derive(Clone, Debug, Default)]
pub struct Ingress {
    pub namespace: String,
    pub name: String,

    /// The structured `spec.ingressClassName` field, when set.
    pub class: Option<String>,
    pub annotations: HashMap<String, String>,

    /// Rule hosts in source order.
    pub rules_hosts: Vec<String>,

    /// Load-balancer endpoints reported by the source cluster, hostname
    /// preferred over IP literal.
    pub upstreams: Vec<String>,

    /// TLS blocks flattened to one entry per host, in source order.
    pub tls: Vec<TlsEntry>,

    /// Whether the owning source cluster is in maintenance mode.
    pub maintenance: bool,

    /// Logical name of the source cluster this object was observed in.
    pub source_cluster: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsEntry {
    pub host: String,
    pub secret_name: String,
}

impl Ingress {
    /// The class this ingress declares: the legacy annotation wins over the
    /// structured field.
    pub fn usable_class(&self) -> Option<&str> {
        match self.annotations.get(INGRESS_CLASS_ANNOTATION) {
            Some(class) if !class.is_empty() => Some(class),
            _ => self.class.as_deref(),
        }
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.annotations
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Whether two observations describe the same ingress definition.
    ///
    /// Hosts and upstreams are compared as sets: the orderings reported by the
    /// API server are not stable across relists and must not register as a
    /// change.
    pub fn same_definition(&self, other: &Ingress) -> bool {
        self.name == other.name
            && self.namespace == other.namespace
            && sorted(&self.rules_hosts) == sorted(&other.rules_hosts)
            && sorted(&self.upstreams) == sorted(&other.upstreams)
            && self.annotations == other.annotations
            && self.tls == other.tls
            && self.usable_class() == other.usable_class()
    }
}

fn sorted(items: &[String]) -> Vec<&str> {
    let mut items = items.iter().map(String::as_str).collect::<Vec<_>>();
    items.sort_unstable();
    items
}

/// A TLS secret reduced to the material the control plane cares about.
///
/// Only secrets of type `kubernetes.io/tls` are ever ingested; the PEM blobs
/// are carried verbatim into the emitted listener configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSecret {
    pub namespace: String,
    pub name: String,
    pub cert: String,
    pub key: String,
}

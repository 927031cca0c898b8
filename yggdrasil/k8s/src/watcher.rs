use crate::{ingress::probe_ingress_api, IngressApi, SourceCluster, WatcherMetrics};
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use futures::prelude::*;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, DynamicObject},
    runtime::{
        reflector::{self, store::Writer, Store},
        watcher::{self, Event as WatchEvent},
        WatchStreamExt,
    },
    Client,
};
use tokio::{sync::mpsc, time};
use tracing::{info_span, warn, Instrument};
use yggdrasil_core::{Event, Ingress, TlsSecret};

/// Bounds how long a missed delete can go unnoticed: the local replica is
/// authoritative, so a periodic pulse forces a regeneration from it.
const RESYNC_INTERVAL: time::Duration = time::Duration::from_secs(60);

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// An eventually-consistent replica of the ingress objects (and, when secret
/// sync is enabled, the TLS secrets) of one source cluster.
///
/// The watcher exclusively owns its local stores; everything downstream reads
/// point-in-time snapshots of them.
pub struct ClusterWatcher {
    name: String,
    maintenance: bool,
    api: IngressApi,
    ingresses: Store<DynamicObject>,
    secrets: Option<Store<Secret>>,
}

impl ClusterWatcher {
    /// Probes the cluster's ingress API, starts the watch tasks, and blocks
    /// until the initial lists have populated the local stores.
    pub async fn start(
        client: Client,
        source: &SourceCluster,
        sync_secrets: bool,
        events: mpsc::Sender<Event>,
        metrics: WatcherMetrics,
        shutdown: drain::Watch,
    ) -> Result<Self> {
        let name = source.label().to_string();
        let api = probe_ingress_api(&client)
            .await
            .with_context(|| format!("probing {name}"))?;

        let resource = api.api_resource();
        let ingress_api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
        let writer = Writer::new(resource);
        let ingresses = writer.as_reader();
        let watch = reflector::reflector(
            writer,
            watcher::watcher(ingress_api, watcher::Config::default()).default_backoff(),
        );
        let mut change_log = ChangeLog::new(api);
        tokio::spawn(
            dispatch(
                watch,
                events.clone(),
                Event::IngressChanged,
                move |event| change_log.observe(event),
                Health {
                    metrics: metrics.clone(),
                    cluster: name.clone(),
                    resource: "ingresses",
                },
                shutdown.clone(),
            )
            .instrument(info_span!("ingresses", cluster = %name)),
        );

        let secrets = if sync_secrets {
            let secret_api: Api<Secret> = Api::all(client);
            let (store, writer) = reflector::store::<Secret>();
            let config = watcher::Config::default().fields(&format!("type={TLS_SECRET_TYPE}"));
            let watch = reflector::reflector(
                writer,
                watcher::watcher(secret_api, config).default_backoff(),
            );
            tokio::spawn(
                dispatch(
                    watch,
                    events,
                    Event::SecretChanged,
                    |event: &WatchEvent<Secret>| {
                        matches!(
                            event,
                            WatchEvent::Apply(_) | WatchEvent::Delete(_) | WatchEvent::InitDone
                        )
                    },
                    Health {
                        metrics,
                        cluster: name.clone(),
                        resource: "secrets",
                    },
                    shutdown,
                )
                .instrument(info_span!("secrets", cluster = %name)),
            );
            Some(store)
        } else {
            None
        };

        // LISTING -> WATCHING: readers are unblocked only once the initial
        // list has landed in the store.
        ingresses
            .wait_until_ready()
            .await
            .with_context(|| format!("initial ingress list for {name} failed"))?;
        if let Some(secrets) = &secrets {
            secrets
                .wait_until_ready()
                .await
                .with_context(|| format!("initial secret list for {name} failed"))?;
        }

        Ok(Self {
            name,
            maintenance: source.maintenance,
            api,
            ingresses,
            secrets,
        })
    }

    /// Snapshot of the local ingress cache, normalized. Objects that no
    /// longer parse are logged and dropped, never fatal.
    pub fn ingresses(&self) -> Vec<Ingress> {
        self.ingresses
            .state()
            .iter()
            .filter_map(|obj| {
                self.api
                    .convert(obj, self.maintenance, &self.name)
                    .map_err(|error| {
                        warn!(
                            %error,
                            cluster = %self.name,
                            namespace = obj.metadata.namespace.as_deref().unwrap_or(""),
                            name = obj.metadata.name.as_deref().unwrap_or(""),
                            "dropping unparseable ingress",
                        );
                    })
                    .ok()
            })
            .collect()
    }

    /// Snapshot of the local TLS secret cache. Empty when secret sync is off.
    pub fn secrets(&self) -> Vec<TlsSecret> {
        let Some(store) = &self.secrets else {
            return Vec::new();
        };
        store
            .state()
            .iter()
            .filter(|secret| secret.type_.as_deref() == Some(TLS_SECRET_TYPE))
            .map(|secret| {
                let data = secret.data.clone().unwrap_or_default();
                let entry = |key: &str| {
                    data.get(key)
                        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                        .unwrap_or_default()
                };
                TlsSecret {
                    namespace: secret.metadata.namespace.clone().unwrap_or_default(),
                    name: secret.metadata.name.clone().unwrap_or_default(),
                    cert: entry("tls.crt"),
                    key: entry("tls.key"),
                }
            })
            .collect()
    }
}

struct Health {
    metrics: WatcherMetrics,
    cluster: String,
    resource: &'static str,
}

impl Health {
    fn set(&self, down: bool) {
        self.metrics
            .set_disconnected(&self.cluster, self.resource, down);
    }
}

/// Forwards change notifications from a watch stream into the shared event
/// sink. Only events `significant` classifies as altering the aggregated
/// view are forwarded. Transport errors are retried by the stream's own
/// backoff; the cache is retained across reconnects and reconciled by the
/// re-list.
async fn dispatch<S, K>(
    watch: S,
    events: mpsc::Sender<Event>,
    kind: Event,
    mut significant: impl FnMut(&WatchEvent<K>) -> bool,
    health: Health,
    shutdown: drain::Watch,
) where
    S: Stream<Item = watcher::Result<WatchEvent<K>>>,
{
    let mut resync = time::interval(RESYNC_INTERVAL);
    resync.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    health.set(false);

    tokio::pin! {
        let watch = watch;
        let drained = shutdown.signaled();
    }

    loop {
        tokio::select! {
            ev = watch.next() => match ev {
                Some(Ok(event)) => {
                    health.set(false);
                    if significant(&event) && events.send(kind).await.is_err() {
                        return;
                    }
                }
                Some(Err(error)) => {
                    health.set(true);
                    warn!(%error, "watch disconnected; retrying");
                }
                None => return,
            },
            _ = resync.tick() => {
                if events.send(kind).await.is_err() {
                    return;
                }
            }
            _ = &mut drained => return,
        }
    }
}

/// Last-seen ingress definitions, used to drop watch events that change
/// nothing the translator reads.
///
/// The API server re-delivers objects on relists and on writes that only
/// touch fields this control plane ignores (status conditions, managed
/// fields); comparing normalized definitions keeps those from marking the
/// snapshot dirty. A relist is diffed wholesale at `InitDone`, which is also
/// what surfaces deletes missed while disconnected.
struct ChangeLog {
    api: IngressApi,
    seen: HashMap<(String, String), Ingress>,
    relist: Option<HashMap<(String, String), Ingress>>,
}

impl ChangeLog {
    fn new(api: IngressApi) -> Self {
        Self {
            api,
            seen: HashMap::new(),
            relist: None,
        }
    }

    /// Whether this event alters the aggregated view.
    fn observe(&mut self, event: &WatchEvent<DynamicObject>) -> bool {
        match event {
            WatchEvent::Apply(obj) => self.apply(obj),
            WatchEvent::Delete(obj) => self.seen.remove(&key_of(obj)).is_some(),
            WatchEvent::Init => {
                self.relist = Some(HashMap::new());
                false
            }
            WatchEvent::InitApply(obj) => {
                // Buffered; the whole relist is judged at InitDone.
                let api = self.api;
                if let Some(relist) = &mut self.relist {
                    if let Ok(ingress) = api.convert(obj, false, "") {
                        relist.insert(key_of(obj), ingress);
                    }
                }
                false
            }
            WatchEvent::InitDone => {
                let Some(relist) = self.relist.take() else {
                    return true;
                };
                let changed = relist.len() != self.seen.len()
                    || relist.iter().any(|(key, ingress)| {
                        self.seen
                            .get(key)
                            .map_or(true, |previous| !previous.same_definition(ingress))
                    });
                self.seen = relist;
                changed
            }
        }
    }

    fn apply(&mut self, obj: &DynamicObject) -> bool {
        let key = key_of(obj);
        // Maintenance flag and source cluster are per-watcher constants;
        // definition equality ignores both.
        let Ok(ingress) = self.api.convert(obj, false, "") else {
            // An object that stopped parsing drops out of the served view.
            return self.seen.remove(&key).is_some();
        };
        match self.seen.get(&key) {
            Some(previous) if previous.same_definition(&ingress) => false,
            _ => {
                self.seen.insert(key, ingress);
                true
            }
        }
    }
}

fn key_of(obj: &DynamicObject) -> (String, String) {
    (
        obj.metadata.namespace.clone().unwrap_or_default(),
        obj.metadata.name.clone().unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ingress_obj(name: &str, host: &str, upstreams: &[&str]) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"name": name, "namespace": "ns"},
            "spec": {"rules": [{"host": host}]},
            "status": {
                "loadBalancer": {
                    "ingress": upstreams.iter().map(|u| json!({"ip": u})).collect::<Vec<_>>(),
                },
            },
        }))
        .unwrap()
    }

    fn change_log() -> ChangeLog {
        ChangeLog::new(IngressApi::NetworkingV1)
    }

    #[test]
    fn redelivered_definition_is_not_significant() {
        let mut log = change_log();
        let obj = ingress_obj("ing", "app.com", &["1.2.3.4"]);
        assert!(log.observe(&WatchEvent::Apply(obj.clone())));
        assert!(!log.observe(&WatchEvent::Apply(obj)));
    }

    #[test]
    fn changed_upstreams_are_significant() {
        let mut log = change_log();
        assert!(log.observe(&WatchEvent::Apply(ingress_obj("ing", "app.com", &["1.2.3.4"]))));
        assert!(log.observe(&WatchEvent::Apply(ingress_obj(
            "ing",
            "app.com",
            &["1.2.3.4", "5.6.7.8"],
        ))));
    }

    #[test]
    fn upstream_reordering_is_not_significant() {
        let mut log = change_log();
        assert!(log.observe(&WatchEvent::Apply(ingress_obj(
            "ing",
            "app.com",
            &["1.2.3.4", "5.6.7.8"],
        ))));
        assert!(!log.observe(&WatchEvent::Apply(ingress_obj(
            "ing",
            "app.com",
            &["5.6.7.8", "1.2.3.4"],
        ))));
    }

    #[test]
    fn deletes_are_significant_once() {
        let mut log = change_log();
        let obj = ingress_obj("ing", "app.com", &["1.2.3.4"]);
        assert!(log.observe(&WatchEvent::Apply(obj.clone())));
        assert!(log.observe(&WatchEvent::Delete(obj.clone())));
        assert!(!log.observe(&WatchEvent::Delete(obj)));
    }

    #[test]
    fn identical_relist_is_not_significant() {
        let mut log = change_log();
        let obj = ingress_obj("ing", "app.com", &["1.2.3.4"]);
        assert!(log.observe(&WatchEvent::Apply(obj.clone())));

        assert!(!log.observe(&WatchEvent::Init));
        assert!(!log.observe(&WatchEvent::InitApply(obj)));
        assert!(!log.observe(&WatchEvent::InitDone));
    }

    #[test]
    fn relist_missing_an_object_is_significant() {
        let mut log = change_log();
        assert!(log.observe(&WatchEvent::Apply(ingress_obj("a", "a.com", &["1.1.1.1"]))));
        assert!(log.observe(&WatchEvent::Apply(ingress_obj("b", "b.com", &["2.2.2.2"]))));

        // "a" was deleted while the watch was away.
        assert!(!log.observe(&WatchEvent::Init));
        assert!(!log.observe(&WatchEvent::InitApply(ingress_obj(
            "b",
            "b.com",
            &["2.2.2.2"],
        ))));
        assert!(log.observe(&WatchEvent::InitDone));
    }

    #[test]
    fn object_that_stops_parsing_is_a_removal() {
        let mut log = change_log();
        assert!(log.observe(&WatchEvent::Apply(ingress_obj("ing", "app.com", &["1.2.3.4"]))));

        let broken: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"name": "ing", "namespace": "ns"},
            "spec": {"rules": "not-a-list"},
        }))
        .unwrap();
        assert!(log.observe(&WatchEvent::Apply(broken.clone())));
        assert!(!log.observe(&WatchEvent::Apply(broken)));
    }
}

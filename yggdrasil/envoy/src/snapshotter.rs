use crate::Configurator;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use yggdrasil_core::{Event, IngressSource};
use yggdrasil_xds::SnapshotCache;

/// Drives the pipeline: watches the aggregated event stream, regenerates on
/// TICK when anything changed, and installs the result in the cache.
///
/// Change events only mark the state dirty; the TICK gate collapses a burst
/// of object changes into at most one regeneration per tick interval. A
/// failed generation leaves the dirty flag set so the next TICK retries, and
/// the last good snapshot keeps serving in the meantime.
pub struct Snapshotter<S> {
    cache: SnapshotCache,
    configurator: Configurator,
    source: S,
    events: mpsc::Receiver<Event>,
}

impl<S: IngressSource> Snapshotter<S> {
    pub fn new(
        cache: SnapshotCache,
        configurator: Configurator,
        source: S,
        events: mpsc::Receiver<Event>,
    ) -> Self {
        Self {
            cache,
            configurator,
            source,
            events,
        }
    }

    pub async fn run(mut self) {
        info!("started snapshotter");
        let mut dirty = false;
        while let Some(event) = self.events.recv().await {
            match event {
                Event::IngressChanged | Event::SecretChanged => dirty = true,
                Event::Tick if dirty => {
                    let ingresses = self.source.ingresses();
                    let secrets = self.source.secrets();
                    match self.configurator.generate(&ingresses, &secrets) {
                        Ok(snapshot) => {
                            self.cache.set(self.configurator.node_id(), snapshot);
                            dirty = false;
                        }
                        Err(error) => {
                            warn!(%error, "configuration generation failed; will retry");
                        }
                    }
                }
                Event::Tick => {}
            }
        }
        debug!("event stream closed; snapshotter exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{configurator::Options, metrics::Metrics};
    use prometheus_client::registry::Registry;
    use yggdrasil_core::{Ingress, TlsSecret, INGRESS_CLASS_ANNOTATION};
    use yggdrasil_xds::IdHasher;

    struct FixedSource(Vec<Ingress>);

    impl IngressSource for FixedSource {
        fn ingresses(&self) -> Vec<Ingress> {
            self.0.clone()
        }

        fn secrets(&self) -> Vec<TlsSecret> {
            Vec::new()
        }
    }

    fn ingress(host: &str) -> Ingress {
        Ingress {
            annotations: [(INGRESS_CLASS_ANNOTATION.to_string(), "bar".to_string())]
                .into_iter()
                .collect(),
            rules_hosts: vec![host.to_string()],
            upstreams: vec!["lb.example.com".to_string()],
            ..Default::default()
        }
    }

    fn configurator() -> Configurator {
        Configurator::new(
            Options {
                node_id: "envoy-node".to_string(),
                ingress_classes: vec!["bar".to_string()],
                ..Default::default()
            },
            Metrics::register(&mut Registry::default()),
        )
    }

    #[tokio::test]
    async fn regenerates_only_on_dirty_tick() {
        let cache = SnapshotCache::new(IdHasher);
        let (tx, rx) = mpsc::channel(8);
        let snapshotter = Snapshotter::new(
            cache.clone(),
            configurator(),
            FixedSource(vec![ingress("app.com")]),
            rx,
        );
        let task = tokio::spawn(snapshotter.run());

        // A tick with nothing dirty publishes nothing.
        tx.send(Event::Tick).await.unwrap();
        // A change without a tick publishes nothing either.
        tx.send(Event::IngressChanged).await.unwrap();
        tx.send(Event::Tick).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let snapshot = cache.get("envoy-node").expect("snapshot must be installed");
        assert_eq!(
            snapshot
                .resources(yggdrasil_xds::ResourceType::Cluster)
                .resources
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn clean_ticks_do_not_publish() {
        let cache = SnapshotCache::new(IdHasher);
        let (tx, rx) = mpsc::channel(8);
        let snapshotter = Snapshotter::new(
            cache.clone(),
            configurator(),
            FixedSource(vec![ingress("app.com")]),
            rx,
        );
        let task = tokio::spawn(snapshotter.run());

        tx.send(Event::Tick).await.unwrap();
        tx.send(Event::Tick).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(cache.get("envoy-node").is_none());
    }
}

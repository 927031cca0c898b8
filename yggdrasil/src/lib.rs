#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod admin;
pub mod args;

pub use self::args::Args;

use anyhow::Result;
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};
use yggdrasil_envoy::{Configurator, Metrics, Options, Snapshotter};
use yggdrasil_k8s::{
    kubeconfig_client, make_client, run_ticker, Aggregator, ClusterWatcher, SourceCluster,
    WatcherMetrics,
};
use yggdrasil_xds::{DiscoveryServer, IdHasher, SnapshotCache};

/// The size of the shared event sink between the watchers and the
/// snapshotter. Change events are collapsed by the TICK gate, so depth only
/// needs to absorb bursts.
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Fully resolved configuration, flags merged over the config file.
#[derive(Debug)]
pub struct Settings {
    /// Discovery (xDS) gRPC listen address.
    pub address: SocketAddr,
    /// Health and metrics listen address.
    pub health_address: SocketAddr,
    pub node_name: String,
    pub ingress_classes: Vec<String>,
    pub clusters: Vec<SourceCluster>,
    pub kubeconfig_sources: Vec<PathBuf>,
    pub sync_secrets: bool,
    pub options: Options,
}

pub async fn run(settings: Settings) -> Result<()> {
    let mut registry = Registry::default();
    let yggdrasil_registry = registry.sub_registry_with_prefix("yggdrasil");
    let metrics = Metrics::register(yggdrasil_registry);
    let watcher_metrics = WatcherMetrics::register(yggdrasil_registry);
    let registry = Arc::new(registry);

    let (drain_signal, drain_watch) = drain::channel();
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

    // One watcher per source cluster; startup blocks until every initial
    // list has landed so the first snapshot is complete rather than partial.
    let mut sources = Vec::with_capacity(settings.clusters.len());
    for source in settings.clusters {
        let client = make_client(&source)?;
        sources.push((client, source));
    }
    for path in &settings.kubeconfig_sources {
        let client = kubeconfig_client(path).await?;
        sources.push((
            client,
            SourceCluster {
                name: path.display().to_string(),
                ..Default::default()
            },
        ));
    }

    let watchers = future::try_join_all(sources.into_iter().map(|(client, source)| {
        let events = events_tx.clone();
        let shutdown = drain_watch.clone();
        let sync_secrets = settings.sync_secrets;
        let metrics = metrics.clone();
        let watcher_metrics = watcher_metrics.clone();
        async move {
            metrics.set_maintenance(source.label(), source.maintenance);
            ClusterWatcher::start(client, &source, sync_secrets, events, watcher_metrics, shutdown)
                .await
        }
    }))
    .await?;
    info!(clusters = watchers.len(), "all source caches populated");

    let aggregator = Aggregator::new(watchers);
    tokio::spawn(run_ticker(events_tx, drain_watch.clone()).instrument(info_span!("ticker")));

    let cache = SnapshotCache::new(IdHasher);
    let configurator = Configurator::new(settings.options, metrics);
    let snapshotter = Snapshotter::new(cache.clone(), configurator, aggregator, events_rx);
    tokio::spawn(snapshotter.run().instrument(info_span!("snapshotter")));

    tokio::spawn(grpc(settings.address, cache, drain_watch.clone()));
    tokio::spawn(
        admin::serve(settings.health_address, registry).instrument(info_span!("admin")),
    );

    // Block on the shutdown signal, then drain: watchers and the ticker stop
    // feeding events, the snapshotter exits when the stream closes, and the
    // gRPC server gracefully stops its streams.
    shutdown_signal().await;
    info!("shutting down");
    drain_signal.drain().await;
    Ok(())
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(addr: SocketAddr, cache: SnapshotCache, drain: drain::Watch) -> Result<()> {
    let discovery = DiscoveryServer::new(cache, drain.clone());

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(discovery.aggregated())
            .add_service(discovery.listeners())
            .add_service(discovery.clusters())
            .add_service(discovery.routes())
            .add_service(discovery.endpoints())
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "discovery gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(error) => {
            tracing::error!(%error, "failed to register SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

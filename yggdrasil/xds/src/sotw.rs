use crate::{ResourceType, Snapshot, SnapshotCache};
use ahash::AHashMap as HashMap;
use futures::prelude::*;
use std::{pin::Pin, sync::Arc};
use tokio::sync::watch;
use tonic::Status;
use tracing::{debug, warn};
use xds_api::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};

pub(crate) type DiscoveryResponseStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;

/// State-of-the-world subscription bookkeeping for one stream.
///
/// For every resource type the subscriber has asked for, tracks the version
/// it is known to hold: the version it announced (or acknowledged), or the
/// version we last pushed. A push goes out exactly when the installed
/// snapshot's version for that type differs.
#[derive(Default)]
pub(crate) struct StreamState {
    subscriptions: HashMap<ResourceType, Subscription>,
    nonce: u64,
}

#[derive(Default)]
struct Subscription {
    known_version: Option<String>,
}

impl StreamState {
    /// Digests a request, returning the resource type it addresses.
    pub(crate) fn apply_request(
        &mut self,
        req: &DiscoveryRequest,
        default_type: Option<ResourceType>,
    ) -> Result<ResourceType, Status> {
        let resource_type = resolve_type(&req.type_url, default_type)?;
        let sub = self.subscriptions.entry(resource_type).or_default();

        if let Some(error) = &req.error_detail {
            // A NACK echoes the last good version; keep whatever we sent
            // recorded so the rejected version is not re-pushed until a new
            // snapshot is installed.
            warn!(
                code = error.code,
                message = %error.message,
                type_url = resource_type.type_url(),
                "subscriber rejected configuration",
            );
        } else {
            sub.known_version =
                (!req.version_info.is_empty()).then(|| req.version_info.clone());
        }
        Ok(resource_type)
    }

    /// The response owed for `resource_type`, if the snapshot differs from
    /// what the stream last saw.
    pub(crate) fn respond(
        &mut self,
        snapshot: &Snapshot,
        resource_type: ResourceType,
    ) -> Option<DiscoveryResponse> {
        let set = snapshot.resources(resource_type);
        if set.version.is_empty() {
            return None;
        }
        let sub = self.subscriptions.entry(resource_type).or_default();
        if sub.known_version.as_deref() == Some(set.version.as_str()) {
            return None;
        }
        sub.known_version = Some(set.version.clone());
        self.nonce += 1;
        Some(DiscoveryResponse {
            version_info: set.version.clone(),
            resources: set.resources.clone(),
            type_url: resource_type.type_url().to_string(),
            nonce: self.nonce.to_string(),
            ..Default::default()
        })
    }

    /// Responses owed across every subscribed type after a snapshot install.
    pub(crate) fn respond_subscribed(&mut self, snapshot: &Snapshot) -> Vec<DiscoveryResponse> {
        let subscribed: Vec<ResourceType> = ResourceType::ALL
            .into_iter()
            .filter(|t| self.subscriptions.contains_key(t))
            .collect();
        subscribed
            .into_iter()
            .filter_map(|t| self.respond(snapshot, t))
            .collect()
    }
}

fn resolve_type(
    type_url: &str,
    default_type: Option<ResourceType>,
) -> Result<ResourceType, Status> {
    if type_url.is_empty() {
        return default_type
            .ok_or_else(|| Status::invalid_argument("request carries no resource type"));
    }
    ResourceType::from_type_url(type_url)
        .ok_or_else(|| Status::invalid_argument(format!("unsupported resource type {type_url:?}")))
}

/// Runs one subscriber stream against the cache.
///
/// The first request resolves the node id and binds the stream to that node's
/// change feed; from then on responses are driven both by requests
/// (subscribe/ACK/NACK) and by snapshot installs.
pub(crate) fn stream(
    cache: SnapshotCache,
    requests: impl Stream<Item = Result<DiscoveryRequest, Status>> + Send + 'static,
    default_type: Option<ResourceType>,
    shutdown: drain::Watch,
) -> DiscoveryResponseStream {
    Box::pin(async_stream::try_stream! {
        let mut state = StreamState::default();

        tokio::pin! {
            let requests = requests;
            let drained = shutdown.signaled();
        }

        // The first request carries the node; everything afterwards is
        // ACK/NACK traffic and additional type subscriptions.
        let req = tokio::select! {
            req = requests.next() => req,
            _ = &mut drained => return,
        };
        let Some(req) = req else { return };
        let req = req?;
        let resource_type = state.apply_request(&req, default_type)?;
        let node_id = cache.node_id(req.node.as_ref());
        debug!(%node_id, "subscriber connected");
        let mut changes = cache.subscribe(&node_id);
        let snapshot = changes.borrow_and_update().clone();
        if let Some(snapshot) = snapshot {
            if let Some(resp) = state.respond(&snapshot, resource_type) {
                yield resp;
            }
        }
        let mut changes: watch::Receiver<Option<Arc<Snapshot>>> = changes;

        loop {
            enum Event {
                Req(Option<Result<DiscoveryRequest, Status>>),
                Changed(Result<(), watch::error::RecvError>),
                Drained,
            }

            let event = tokio::select! {
                req = requests.next() => Event::Req(req),
                changed = changes.changed() => Event::Changed(changed),
                _ = &mut drained => Event::Drained,
            };

            match event {
                Event::Req(req) => {
                    let Some(req) = req else { return };
                    let req = req?;
                    let resource_type = state.apply_request(&req, default_type)?;
                    let snapshot = changes.borrow().clone();
                    if let Some(snapshot) = snapshot {
                        if let Some(resp) = state.respond(&snapshot, resource_type) {
                            yield resp;
                        }
                    }
                }

                Event::Changed(changed) => {
                    if changed.is_err() {
                        return;
                    }
                    let snapshot = changes.borrow_and_update().clone();
                    if let Some(snapshot) = snapshot {
                        for resp in state.respond_subscribed(&snapshot) {
                            yield resp;
                        }
                    }
                }

                Event::Drained => return,
            }
        }
    })
}

/// Serves the non-streaming discovery variant: one request, one response.
pub(crate) fn fetch(
    cache: &SnapshotCache,
    req: &DiscoveryRequest,
    default_type: Option<ResourceType>,
) -> Result<DiscoveryResponse, Status> {
    let resource_type = resolve_type(&req.type_url, default_type)?;
    let node_id = cache.node_id(req.node.as_ref());
    let snapshot = cache
        .get(&node_id)
        .ok_or_else(|| Status::not_found(format!("no configuration for node {node_id:?}")))?;

    let set = snapshot.resources(resource_type);
    if !req.version_info.is_empty() && req.version_info == set.version {
        return Err(Status::already_exists("configuration is up to date"));
    }
    Ok(DiscoveryResponse {
        version_info: set.version.clone(),
        resources: set.resources.clone(),
        type_url: resource_type.type_url().to_string(),
        ..Default::default()
    })
}

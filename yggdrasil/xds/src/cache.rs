use crate::Snapshot;
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use xds_api::pb::envoy::config::core::v3::Node;

/// Maps a subscribing proxy's `Node` to the cache key it receives
/// configuration under.
pub trait NodeHash: Send + Sync {
    fn id(&self, node: Option<&Node>) -> String;
}

/// The default hasher: the node's declared id, or a sentinel when absent.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdHasher;

impl NodeHash for IdHasher {
    fn id(&self, node: Option<&Node>) -> String {
        match node {
            Some(node) => node.id.clone(),
            None => "unknown".to_string(),
        }
    }
}

/// Holds the most recent [`Snapshot`] per node id and wakes every open
/// subscription when one is replaced.
///
/// Single writer (the snapshotter) per key; any number of subscriber streams
/// read concurrently. Each install is a whole-object swap, so readers hold an
/// `Arc` to a consistent snapshot for as long as they need it.
#[derive(Clone)]
pub struct SnapshotCache {
    inner: Arc<Inner>,
}

struct Inner {
    hasher: Box<dyn NodeHash>,
    nodes: Mutex<HashMap<String, watch::Sender<Option<Arc<Snapshot>>>>>,
}

impl SnapshotCache {
    pub fn new(hasher: impl NodeHash + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                hasher: Box::new(hasher),
                nodes: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn node_id(&self, node: Option<&Node>) -> String {
        self.inner.hasher.id(node)
    }

    /// Installs a snapshot, notifying every stream subscribed to `node_id`.
    pub fn set(&self, node_id: &str, snapshot: Snapshot) {
        self.entry(node_id).send_replace(Some(Arc::new(snapshot)));
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        let nodes = self.inner.nodes.lock();
        nodes.get(node_id).and_then(|tx| tx.borrow().clone())
    }

    /// A change feed for `node_id`. The receiver observes installs in order;
    /// it starts out holding whatever snapshot is already present.
    pub fn subscribe(&self, node_id: &str) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.entry(node_id).subscribe()
    }

    fn entry(&self, node_id: &str) -> watch::Sender<Option<Arc<Snapshot>>> {
        let mut nodes = self.inner.nodes.lock();
        nodes
            .entry(node_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }
}

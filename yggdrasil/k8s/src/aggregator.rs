use crate::ClusterWatcher;
use tokio::{sync::mpsc, time};
use tracing::{debug, info};
use yggdrasil_core::{Event, Ingress, IngressSource, TlsSecret};

/// How often a TICK pulse is emitted. A burst of object changes collapses
/// into at most one regeneration per interval.
const TICK_INTERVAL: time::Duration = time::Duration::from_secs(5);

/// Fan-in over every source cluster's watcher.
///
/// The aggregator never blocks on a watcher: reads are point-in-time
/// snapshots of each local store, so one stalled cluster only means its view
/// stops advancing.
pub struct Aggregator {
    watchers: Vec<ClusterWatcher>,
}

impl Aggregator {
    pub fn new(watchers: Vec<ClusterWatcher>) -> Self {
        Self { watchers }
    }
}

impl IngressSource for Aggregator {
    fn ingresses(&self) -> Vec<Ingress> {
        self.watchers.iter().flat_map(|w| w.ingresses()).collect()
    }

    fn secrets(&self) -> Vec<TlsSecret> {
        self.watchers.iter().flat_map(|w| w.secrets()).collect()
    }
}

/// Emits a TICK every five seconds until shutdown.
pub async fn run_ticker(events: mpsc::Sender<Event>, shutdown: drain::Watch) {
    let mut tick = time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    tokio::pin! {
        let drained = shutdown.signaled();
    }

    info!("started ticker");
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if events.send(Event::Tick).await.is_err() {
                    debug!("event channel closed; stopping ticker");
                    return;
                }
            }
            _ = &mut drained => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticker_emits_ticks() {
        let (tx, mut rx) = mpsc::channel(8);
        let (signal, watch) = drain::channel();
        tokio::spawn(run_ticker(tx, watch));

        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some(Event::Tick));
        }

        signal.drain().await;
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn empty_aggregator_reads_empty() {
        let aggregator = Aggregator::new(Vec::new());
        assert!(aggregator.ingresses().is_empty());
        assert!(aggregator.secrets().is_empty());
    }
}

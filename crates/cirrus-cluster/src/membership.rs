//! Background membership sync
//!
//! Periodically asks one reachable storage node for its gossip view and
//! drops every member it reports as dead from the coordinator's ring.
//! Re-adding nodes is an administrative action and never happens here.

use cirrus_client::NodePool;
use cirrus_common::{Error, MemberStatus, NodeId, Result};
use cirrus_placement::HashRing;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Run one sync round. Returns the nodes removed from the ring.
///
/// Ring members are probed in random order until one answers within
/// `probe_timeout`; fails only if none does.
pub async fn sync_round(
    ring: &RwLock<HashRing>,
    nodes: &NodePool,
    probe_timeout: Duration,
) -> Result<Vec<NodeId>> {
    let mut candidates: Vec<NodeId> = ring
        .read()
        .node_ids()
        .filter(|id| nodes.contains(id))
        .cloned()
        .collect();
    candidates.shuffle(&mut rand::thread_rng());

    for id in candidates {
        let Some(client) = nodes.get(&id) else {
            continue;
        };
        let members = match tokio::time::timeout(probe_timeout, client.cluster_status()).await {
            Ok(Ok(members)) => members,
            Ok(Err(e)) => {
                debug!(node = %id, error = %e, "membership probe failed");
                continue;
            }
            Err(_) => {
                debug!(node = %id, "membership probe timed out");
                continue;
            }
        };

        let dead: Vec<NodeId> = members
            .into_iter()
            .filter(|(_, info)| info.status == MemberStatus::Dead)
            .map(|(member, _)| member)
            .collect();

        // One write lock for the whole update so readers see all or nothing
        let removed: Vec<NodeId> = {
            let mut ring = ring.write();
            dead.into_iter().filter(|d| ring.remove_node(d)).collect()
        };
        for node in &removed {
            info!(node = %node, reporter = %id, "removed dead node from ring");
        }
        return Ok(removed);
    }

    Err(Error::internal("no storage node answered the membership probe"))
}

/// Handle to the running sync loop
pub struct SyncTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncTask {
    pub fn spawn(
        ring: Arc<RwLock<HashRing>>,
        nodes: Arc<NodePool>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            info!(interval = ?interval, "membership sync started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sync_round(&ring, &nodes, probe_timeout).await {
                            debug!(error = %e, "membership sync round skipped");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("membership sync stopped");
        });

        Self { shutdown, handle }
    }

    /// Signal the loop and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "membership sync task failed");
            }
        }
    }

    pub fn abort(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::testing::{FakeNode, eventually, pool};
    use cirrus_common::CoordinatorConfig;
    use std::sync::atomic::Ordering;

    fn config(sync_interval_ms: u64) -> CoordinatorConfig {
        CoordinatorConfig {
            sync_interval_ms,
            probe_timeout_ms: 100,
            ..CoordinatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_sync_removes_dead_nodes() {
        let (a, b, c) = (FakeNode::new(), FakeNode::new(), FakeNode::new());
        for n in [&a, &b, &c] {
            n.set_member("a", MemberStatus::Alive);
            n.set_member("b", MemberStatus::Dead);
            n.set_member("c", MemberStatus::Suspect);
        }
        let coord = Coordinator::new(config(5_000), pool(&[("a", &a), ("b", &b), ("c", &c)]));

        let removed = coord.sync_once().await.unwrap();
        assert_eq!(removed, vec![NodeId::from("b")]);
        assert_eq!(coord.ring_nodes(), vec![NodeId::from("a"), NodeId::from("c")]);
        assert!(!coord.replicas("bk", "key").contains(&NodeId::from("b")));

        // already gone, suspect members stay
        assert!(coord.sync_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_skips_unreachable_probes() {
        let (a, b) = (FakeNode::failing(), FakeNode::new());
        b.set_member("a", MemberStatus::Dead);
        let coord = Coordinator::new(config(5_000), pool(&[("a", &a), ("b", &b)]));

        assert_eq!(coord.sync_once().await.unwrap(), vec![NodeId::from("a")]);

        b.set_failing(true);
        assert!(coord.sync_once().await.is_err());
    }

    #[tokio::test]
    async fn test_sync_loop_start_stop() {
        let (a, b) = (FakeNode::new(), FakeNode::new());
        a.set_member("b", MemberStatus::Dead);
        b.set_member("b", MemberStatus::Dead);
        let coord = Coordinator::new(config(20), pool(&[("a", &a), ("b", &b)]));

        coord.start();
        coord.start();
        let removed = eventually(Duration::from_secs(2), || {
            coord.ring_nodes() == vec![NodeId::from("a")]
        })
        .await;
        assert!(removed);

        coord.stop().await;
        let calls = a.status_calls.load(Ordering::SeqCst) + b.status_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after = a.status_calls.load(Ordering::SeqCst) + b.status_calls.load(Ordering::SeqCst);
        assert_eq!(calls, after);
    }
}

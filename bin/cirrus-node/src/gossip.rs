//! Gossip failure detector
//!
//! Each round promotes expired suspects to dead, then exchanges digests
//! with one random live peer. A peer that fails to answer within the probe
//! timeout is marked suspect.

use crate::membership::{LearnedPeer, Membership};
use cirrus_client::{MemberDigest, NodeClient, NodePool};
use cirrus_common::{Error, GossipConfig, NodeId, Result};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Drives membership exchange for one node
pub struct Gossiper {
    membership: Arc<Membership>,
    peers: Arc<NodePool>,
    config: GossipConfig,
}

impl Gossiper {
    pub const fn new(membership: Arc<Membership>, peers: Arc<NodePool>, config: GossipConfig) -> Self {
        Self {
            membership,
            peers,
            config,
        }
    }

    #[must_use]
    pub const fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    #[must_use]
    pub const fn peers(&self) -> &Arc<NodePool> {
        &self.peers
    }

    /// Answer an incoming digest with our own, after merging it
    pub fn handle(&self, from: &NodeId, digest: &[MemberDigest]) -> Vec<MemberDigest> {
        debug!(from = %from, members = digest.len(), "gossip received");
        let learned = self.membership.merge(digest);
        self.membership.record_contact(from);
        self.register(learned);
        self.membership.digest()
    }

    /// Create clients for peers whose address we just learned
    fn register(&self, learned: Vec<LearnedPeer>) {
        for peer in learned {
            if peer.id == *self.membership.local_id() || self.peers.contains(&peer.id) {
                continue;
            }
            match NodeClient::connect_lazy(peer.id.clone(), &peer.address) {
                Ok(client) => {
                    info!(node = %peer.id, address = %peer.address, "registered gossip peer");
                    self.peers.insert(peer.id, Arc::new(client));
                }
                Err(e) => warn!(node = %peer.id, address = %peer.address, error = %e, "unusable peer address"),
            }
        }
    }

    /// Run one gossip round, returning the peer that answered.
    ///
    /// `Ok(None)` means there was nobody to probe.
    pub async fn round(&self) -> Result<Option<NodeId>> {
        self.membership
            .promote_dead(self.config.dead_timeout(), Instant::now());

        let targets: Vec<NodeId> = self
            .membership
            .probe_targets()
            .into_iter()
            .filter(|id| self.peers.contains(id))
            .collect();
        let Some(target) = targets.choose(&mut rand::thread_rng()).cloned() else {
            return Ok(None);
        };
        let Some(client) = self.peers.get(&target) else {
            return Ok(None);
        };

        let digest = self.membership.digest();
        let local = self.membership.local_id();
        let outcome = tokio::time::timeout(self.config.probe_timeout(), client.gossip(local, digest))
            .await
            .unwrap_or_else(|_| Err(Error::internal(format!("gossip probe to {target} timed out"))));

        match outcome {
            Ok(reply) => {
                self.membership.record_contact(&target);
                let learned = self.membership.merge(&reply);
                self.register(learned);
                debug!(peer = %target, "gossip round complete");
                Ok(Some(target))
            }
            Err(e) => {
                self.membership.mark_suspect(&target);
                Err(e)
            }
        }
    }
}

/// Handle to the running gossip loop
pub struct GossipTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl GossipTask {
    pub fn spawn(gossiper: Arc<Gossiper>) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let interval = gossiper.config.interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval = ?interval, "gossip started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = gossiper.round().await {
                            debug!(error = %e, "gossip probe failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("gossip stopped");
        });

        Self { shutdown, handle }
    }

    /// Signal the loop and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "gossip task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cirrus_client::{MemberInfo, ReplicaWrite, StorageNode, StoredObject};
    use cirrus_common::MemberStatus;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Routes gossip straight into another in-process gossiper
    struct Loopback {
        target: Arc<Gossiper>,
        down: AtomicBool,
    }

    impl Loopback {
        fn new(target: &Arc<Gossiper>) -> Arc<Self> {
            Arc::new(Self {
                target: Arc::clone(target),
                down: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl StorageNode for Loopback {
        async fn store(&self, _write: &ReplicaWrite) -> Result<()> {
            Err(Error::internal("unsupported"))
        }

        async fn retrieve(&self, _bucket: &str, _key: &str) -> Result<Option<StoredObject>> {
            Err(Error::internal("unsupported"))
        }

        async fn delete(&self, _bucket: &str, _key: &str) -> Result<()> {
            Err(Error::internal("unsupported"))
        }

        async fn assemble(&self, _bucket: &str, _target: &str, _parts: &[String]) -> Result<u64> {
            Err(Error::internal("unsupported"))
        }

        async fn gossip(&self, from: &NodeId, members: Vec<MemberDigest>) -> Result<Vec<MemberDigest>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::internal("connection refused"));
            }
            Ok(self.target.handle(from, &members))
        }

        async fn cluster_status(&self) -> Result<HashMap<NodeId, MemberInfo>> {
            Ok(self.target.membership().cluster_status())
        }
    }

    fn gossiper(id: &str, dead_timeout_ms: u64) -> Arc<Gossiper> {
        let config = GossipConfig {
            interval_ms: 20,
            probe_timeout_ms: 200,
            dead_timeout_ms,
        };
        let membership = Membership::new(NodeId::from(id), format!("http://{id}:7000"));
        Arc::new(Gossiper::new(
            Arc::new(membership),
            Arc::new(NodePool::new()),
            config,
        ))
    }

    /// Make `from` know `to` through a loopback client
    fn link(from: &Arc<Gossiper>, to: &Arc<Gossiper>) -> Arc<Loopback> {
        let id = to.membership().local_id().clone();
        let client = Loopback::new(to);
        from.peers().insert(id.clone(), client.clone());
        from.membership().merge(&[MemberDigest {
            id,
            incarnation: 0,
            status: MemberStatus::Alive,
            address: String::new(),
        }]);
        client
    }

    #[tokio::test]
    async fn test_round_exchanges_views() {
        let (a, b) = (gossiper("a", 10_000), gossiper("b", 10_000));
        link(&a, &b);

        assert_eq!(a.round().await.unwrap(), Some(NodeId::from("b")));
        // b learned a from the pushed digest, address included
        assert_eq!(
            b.membership().status_of(&NodeId::from("a")),
            Some(MemberStatus::Alive)
        );
        assert_eq!(
            b.membership().address_of(&NodeId::from("a")).as_deref(),
            Some("http://a:7000")
        );
        assert!(b.peers().contains(&NodeId::from("a")));
        assert!(a.membership().cluster_status()[&NodeId::from("b")].last_heartbeat > 0);
    }

    #[tokio::test]
    async fn test_suspect_is_refuted() {
        let (a, b) = (gossiper("a", 10_000), gossiper("b", 10_000));
        link(&a, &b);
        a.membership().mark_suspect(&NodeId::from("b"));

        a.round().await.unwrap();
        assert_eq!(b.membership().incarnation(), 1);
        assert_eq!(
            a.membership().status_of(&NodeId::from("b")),
            Some(MemberStatus::Alive)
        );
    }

    #[tokio::test]
    async fn test_failed_probe_suspects_then_kills() {
        let (a, b) = (gossiper("a", 0), gossiper("b", 0));
        let client = link(&a, &b);
        client.down.store(true, Ordering::SeqCst);

        assert!(a.round().await.is_err());
        assert_eq!(
            a.membership().status_of(&NodeId::from("b")),
            Some(MemberStatus::Suspect)
        );

        // next round promotes it and finds nobody left to probe
        assert_eq!(a.round().await.unwrap(), None);
        assert_eq!(
            a.membership().status_of(&NodeId::from("b")),
            Some(MemberStatus::Dead)
        );
    }

    #[tokio::test]
    async fn test_round_without_peers() {
        let a = gossiper("a", 10_000);
        assert_eq!(a.round().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_loop_spreads_death_reports() {
        let (a, b, c) = (gossiper("a", 0), gossiper("b", 0), gossiper("c", 0));
        link(&a, &b);
        link(&b, &a);
        let to_c = link(&a, &c);
        to_c.down.store(true, Ordering::SeqCst);

        let tasks = [GossipTask::spawn(a.clone()), GossipTask::spawn(b.clone())];

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let c_id = NodeId::from("c");
        while b.membership().status_of(&c_id) != Some(MemberStatus::Dead) {
            assert!(tokio::time::Instant::now() < deadline, "death report never reached b");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for task in tasks {
            task.shutdown().await;
        }
    }
}

//! Node-local membership view
//!
//! Every node keeps one entry per known member, itself included. Views are
//! reconciled through gossip digests: the higher incarnation wins, and
//! within one incarnation `dead > suspect > alive`. Only the node itself
//! bumps its own incarnation, which is how it refutes a suspicion.

use cirrus_client::{MemberDigest, MemberInfo};
use cirrus_common::{MemberStatus, NodeEndpoint, NodeId, now_millis};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
struct Member {
    address: String,
    status: MemberStatus,
    incarnation: i64,
    /// Milliseconds since the Unix epoch of the last direct contact
    last_heartbeat: i64,
    suspect_since: Option<Instant>,
}

impl Member {
    fn new(address: String, status: MemberStatus, incarnation: i64) -> Self {
        let suspect_since = (status == MemberStatus::Suspect).then(Instant::now);
        Self {
            address,
            status,
            incarnation,
            last_heartbeat: 0,
            suspect_since,
        }
    }

    /// Whether `(incarnation, status)` supersedes this entry
    const fn superseded_by(&self, incarnation: i64, status: MemberStatus) -> bool {
        incarnation > self.incarnation
            || (incarnation == self.incarnation && status.precedence() > self.status.precedence())
    }

    fn set_status(&mut self, status: MemberStatus) {
        if status == MemberStatus::Suspect {
            if self.status != MemberStatus::Suspect {
                self.suspect_since = Some(Instant::now());
            }
        } else {
            self.suspect_since = None;
        }
        self.status = status;
    }
}

/// A peer learned through gossip that the caller may need a client for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LearnedPeer {
    pub id: NodeId,
    pub address: String,
}

/// Membership view of one storage node
pub struct Membership {
    local_id: NodeId,
    members: RwLock<HashMap<NodeId, Member>>,
}

impl Membership {
    /// Create a view holding only the local node, alive at incarnation 0
    pub fn new(local_id: NodeId, address: impl Into<String>) -> Self {
        let mut members = HashMap::new();
        let mut local = Member::new(address.into(), MemberStatus::Alive, 0);
        local.last_heartbeat = now_millis();
        members.insert(local_id.clone(), local);
        Self {
            local_id,
            members: RwLock::new(members),
        }
    }

    /// Seed the view with configured peers; the local entry is skipped
    #[must_use]
    pub fn with_peers(self, peers: &[NodeEndpoint]) -> Self {
        {
            let mut members = self.members.write();
            for peer in peers.iter().filter(|p| p.id != self.local_id) {
                members
                    .entry(peer.id.clone())
                    .or_insert_with(|| Member::new(peer.address.clone(), MemberStatus::Alive, 0));
            }
        }
        self
    }

    #[must_use]
    pub const fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Current incarnation of the local node
    #[must_use]
    pub fn incarnation(&self) -> i64 {
        self.members
            .read()
            .get(&self.local_id)
            .map_or(0, |m| m.incarnation)
    }

    #[must_use]
    pub fn status_of(&self, id: &NodeId) -> Option<MemberStatus> {
        self.members.read().get(id).map(|m| m.status)
    }

    #[must_use]
    pub fn address_of(&self, id: &NodeId) -> Option<String> {
        self.members
            .read()
            .get(id)
            .map(|m| m.address.clone())
            .filter(|a| !a.is_empty())
    }

    /// Digest of every known member, the local node included
    #[must_use]
    pub fn digest(&self) -> Vec<MemberDigest> {
        let mut digest: Vec<MemberDigest> = self
            .members
            .read()
            .iter()
            .map(|(id, m)| MemberDigest {
                id: id.clone(),
                incarnation: m.incarnation,
                status: m.status,
                address: m.address.clone(),
            })
            .collect();
        digest.sort_by(|a, b| a.id.cmp(&b.id));
        digest
    }

    /// Merge a peer's digest into this view.
    ///
    /// Returns the peers whose address became known through this merge.
    pub fn merge(&self, digest: &[MemberDigest]) -> Vec<LearnedPeer> {
        let mut learned = Vec::new();
        let mut members = self.members.write();

        for remote in digest {
            if remote.id == self.local_id {
                let Some(local) = members.get_mut(&self.local_id) else {
                    continue;
                };
                // Any claim that we are not alive at or above our incarnation is refuted
                if remote.status != MemberStatus::Alive && remote.incarnation >= local.incarnation {
                    local.incarnation = remote.incarnation + 1;
                    info!(
                        reported = %remote.status,
                        incarnation = local.incarnation,
                        "refuting membership report about self"
                    );
                }
                continue;
            }

            match members.get_mut(&remote.id) {
                None => {
                    members.insert(
                        remote.id.clone(),
                        Member::new(remote.address.clone(), remote.status, remote.incarnation),
                    );
                    info!(node = %remote.id, status = %remote.status, "discovered member");
                    if !remote.address.is_empty() {
                        learned.push(LearnedPeer {
                            id: remote.id.clone(),
                            address: remote.address.clone(),
                        });
                    }
                }
                Some(local) => {
                    if local.address.is_empty() && !remote.address.is_empty() {
                        local.address.clone_from(&remote.address);
                        learned.push(LearnedPeer {
                            id: remote.id.clone(),
                            address: remote.address.clone(),
                        });
                    }
                    if local.superseded_by(remote.incarnation, remote.status) {
                        if local.status != remote.status {
                            info!(
                                node = %remote.id,
                                from = %local.status,
                                to = %remote.status,
                                incarnation = remote.incarnation,
                                "member status changed"
                            );
                        }
                        local.incarnation = remote.incarnation;
                        local.set_status(remote.status);
                    }
                }
            }
        }

        learned
    }

    /// Record a successful direct exchange with `id`
    pub fn record_contact(&self, id: &NodeId) {
        if let Some(member) = self.members.write().get_mut(id) {
            member.last_heartbeat = now_millis();
        }
    }

    /// Mark an alive peer as suspect after a failed probe.
    ///
    /// Returns `true` when the status changed.
    pub fn mark_suspect(&self, id: &NodeId) -> bool {
        if *id == self.local_id {
            return false;
        }
        let mut members = self.members.write();
        match members.get_mut(id) {
            Some(member) if member.status == MemberStatus::Alive => {
                member.set_status(MemberStatus::Suspect);
                warn!(node = %id, incarnation = member.incarnation, "member suspected");
                true
            }
            _ => false,
        }
    }

    /// Declare dead every member that stayed suspect for at least `dead_timeout`
    pub fn promote_dead(&self, dead_timeout: Duration, now: Instant) -> Vec<NodeId> {
        let mut promoted = Vec::new();
        let mut members = self.members.write();
        for (id, member) in members.iter_mut() {
            let expired = member
                .suspect_since
                .is_some_and(|since| now.saturating_duration_since(since) >= dead_timeout);
            if member.status == MemberStatus::Suspect && expired {
                member.set_status(MemberStatus::Dead);
                warn!(node = %id, incarnation = member.incarnation, "member declared dead");
                promoted.push(id.clone());
            }
        }
        promoted.sort();
        promoted
    }

    /// Peers worth probing: everything but the local node and dead members
    #[must_use]
    pub fn probe_targets(&self) -> Vec<NodeId> {
        let mut targets: Vec<NodeId> = self
            .members
            .read()
            .iter()
            .filter(|(id, m)| **id != self.local_id && m.status != MemberStatus::Dead)
            .map(|(id, _)| id.clone())
            .collect();
        targets.sort();
        debug!(count = targets.len(), "probe targets");
        targets
    }

    /// Snapshot served by `ClusterStatus`
    #[must_use]
    pub fn cluster_status(&self) -> HashMap<NodeId, MemberInfo> {
        let now = now_millis();
        self.members
            .read()
            .iter()
            .map(|(id, m)| {
                let last_heartbeat = if *id == self.local_id { now } else { m.last_heartbeat };
                let info = MemberInfo {
                    address: m.address.clone(),
                    status: m.status,
                    last_heartbeat,
                };
                (id.clone(), info)
            })
            .collect()
    }
}

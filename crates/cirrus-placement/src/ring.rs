//! Consistent-hash ring
//!
//! The ring is a sorted vector of 32-bit slots plus a slot to owner map.
//! Wrap-around is plain index arithmetic. The ring itself is not
//! synchronized; callers that share it wrap it in a reader-writer lock.
//!
//! The hash is part of the on-cluster contract: changing [`hash32`]
//! reshuffles every object's replica set.

use cirrus_common::NodeId;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Stable 32-bit hash used for both slots and keys (xxh64 folded to 32 bits)
#[must_use]
pub fn hash32(data: &[u8]) -> u32 {
    let h = xxhash_rust::xxh64::xxh64(data, 0);
    #[allow(clippy::cast_possible_truncation)]
    let folded = (h ^ (h >> 32)) as u32;
    folded
}

/// Ring input for an object: `bucket/key`
#[must_use]
pub fn placement_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

/// Consistent-hash ring with `virtual_nodes` slots per physical node
#[derive(Clone, Debug)]
pub struct HashRing {
    virtual_nodes: usize,
    /// Sorted slot hashes
    slots: Vec<u32>,
    owners: HashMap<u32, NodeId>,
    nodes: BTreeSet<NodeId>,
}

impl HashRing {
    #[must_use]
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            slots: Vec::new(),
            owners: HashMap::new(),
            nodes: BTreeSet::new(),
        }
    }

    /// Build a ring containing `nodes`
    pub fn with_nodes<'a>(virtual_nodes: usize, nodes: impl IntoIterator<Item = &'a NodeId>) -> Self {
        let mut ring = Self::new(virtual_nodes);
        for id in nodes {
            ring.add_node(id);
        }
        ring
    }

    /// Insert the node's virtual slots. No-op if the node is already present.
    ///
    /// A slot that collides with another node's slot stays with its current
    /// owner, so the result is independent of insertion order only up to
    /// such collisions.
    pub fn add_node(&mut self, id: &NodeId) -> bool {
        if self.nodes.contains(id) {
            return false;
        }

        for i in 0..self.virtual_nodes {
            let slot = hash32(format!("{id}#{i}").as_bytes());
            if self.owners.contains_key(&slot) {
                continue;
            }
            self.owners.insert(slot, id.clone());
            self.slots.push(slot);
        }
        self.slots.sort_unstable();
        self.nodes.insert(id.clone());

        debug!(node = %id, slots = self.slots.len(), "added node to ring");
        true
    }

    /// Remove every slot owned by `id`. Returns whether the node was present.
    pub fn remove_node(&mut self, id: &NodeId) -> bool {
        if !self.nodes.remove(id) {
            return false;
        }

        self.owners.retain(|_, owner| owner != id);
        let owners = &self.owners;
        self.slots.retain(|slot| owners.contains_key(slot));

        debug!(node = %id, slots = self.slots.len(), "removed node from ring");
        true
    }

    /// Up to `k` distinct owners of `key`, walking clockwise from its hash.
    ///
    /// Returns fewer than `k` only when the ring holds fewer distinct nodes.
    #[must_use]
    pub fn get_nodes(&self, key: &str, k: usize) -> Vec<NodeId> {
        let want = k.min(self.nodes.len());
        let mut result: Vec<NodeId> = Vec::with_capacity(want);
        if want == 0 || self.slots.is_empty() {
            return result;
        }

        let h = hash32(key.as_bytes());
        let start = self.slots.partition_point(|&slot| slot < h);

        for offset in 0..self.slots.len() {
            let slot = self.slots[(start + offset) % self.slots.len()];
            if let Some(owner) = self.owners.get(&slot) {
                if !result.contains(owner) {
                    result.push(owner.clone());
                    if result.len() == want {
                        break;
                    }
                }
            }
        }
        result
    }

    /// Owners of `bucket/key`
    #[must_use]
    pub fn replicas(&self, bucket: &str, key: &str, k: usize) -> Vec<NodeId> {
        self.get_nodes(&placement_key(bucket, key), k)
    }

    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains(id)
    }

    /// Physical nodes in the ring, sorted
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }

    /// Number of physical nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of virtual slots currently on the ring
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub const fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    fn random_keys(count: usize) -> Vec<String> {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        (0..count)
            .map(|i| placement_key("bk", &format!("obj-{i}-{:016x}", rng.r#gen::<u64>())))
            .collect()
    }

    #[test]
    fn test_get_nodes_distinct_and_deterministic() {
        let ring = HashRing::with_nodes(100, &ids(&["a", "b", "c", "d", "e"]));

        for key in random_keys(500) {
            let first = ring.get_nodes(&key, 3);
            assert_eq!(first.len(), 3);
            let unique: HashSet<_> = first.iter().collect();
            assert_eq!(unique.len(), 3);
            assert_eq!(first, ring.get_nodes(&key, 3));
        }
    }

    #[test]
    fn test_get_nodes_caps_at_ring_size() {
        let ring = HashRing::with_nodes(16, &ids(&["a", "b"]));
        assert_eq!(ring.get_nodes("bk/k", 3).len(), 2);
        assert!(HashRing::new(16).get_nodes("bk/k", 3).is_empty());
        assert!(ring.get_nodes("bk/k", 0).is_empty());
    }

    #[test]
    fn test_shorter_lists_are_prefixes() {
        let ring = HashRing::with_nodes(64, &ids(&["a", "b", "c", "d"]));
        for key in random_keys(200) {
            let full = ring.get_nodes(&key, 4);
            for k in 1..4 {
                assert_eq!(ring.get_nodes(&key, k), &full[..k]);
            }
        }
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let mut ring = HashRing::with_nodes(100, &ids(&["a", "b", "c"]));
        let slots = ring.slot_count();
        let before: Vec<_> = random_keys(200).iter().map(|k| ring.get_nodes(k, 3)).collect();

        assert!(!ring.add_node(&NodeId::from("b")));
        assert_eq!(ring.slot_count(), slots);
        let after: Vec<_> = random_keys(200).iter().map(|k| ring.get_nodes(k, 3)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_remove_node() {
        let mut ring = HashRing::with_nodes(100, &ids(&["a", "b", "c"]));
        let b = NodeId::from("b");
        assert!(ring.remove_node(&b));
        assert!(!ring.remove_node(&b));
        assert!(!ring.contains(&b));
        assert_eq!(ring.len(), 2);

        for key in random_keys(200) {
            let nodes = ring.get_nodes(&key, 3);
            assert_eq!(nodes.len(), 2);
            assert!(!nodes.contains(&b));
        }
    }

    #[test]
    fn test_remove_then_add_restores_placement() {
        let mut ring = HashRing::with_nodes(100, &ids(&["a", "b", "c"]));
        let before: Vec<_> = random_keys(200).iter().map(|k| ring.get_nodes(k, 3)).collect();

        ring.remove_node(&NodeId::from("c"));
        ring.add_node(&NodeId::from("c"));
        let after: Vec<_> = random_keys(200).iter().map(|k| ring.get_nodes(k, 3)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_migration_on_add_is_bounded() {
        let keys = random_keys(10_000);
        let mut ring = HashRing::with_nodes(100, &ids(&["a", "b", "c"]));
        let before: Vec<_> = keys.iter().map(|k| ring.get_nodes(k, 3)).collect();

        ring.add_node(&NodeId::from("d"));
        let after: Vec<_> = keys.iter().map(|k| ring.get_nodes(k, 3)).collect();

        let moved = before
            .iter()
            .zip(&after)
            .filter(|(b, a)| b[0] != a[0])
            .count();
        #[allow(clippy::cast_precision_loss)]
        let fraction = moved as f64 / keys.len() as f64;
        assert!(
            (0.15..=0.35).contains(&fraction),
            "primary owner moved for {fraction:.3} of keys"
        );

        // keys only ever move to the new node
        for (b, a) in before.iter().zip(&after) {
            if b[0] != a[0] {
                assert_eq!(a[0], NodeId::from("d"));
            }
        }

        // the old owners keep their relative order around the new one
        let d = NodeId::from("d");
        for (b, a) in before.iter().zip(&after) {
            let rest: Vec<_> = a.iter().filter(|n| **n != d).cloned().collect();
            assert_eq!(rest.as_slice(), &b[..rest.len()]);
        }
    }
}

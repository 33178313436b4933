//! Consistent-hash ring mapping keys to the node that owns them.
//!
//! Every node in the cluster builds the same ring from the same membership, so
//! the mapping must not depend on insertion order or on anything local to the
//! process. Positions are CRC32 (IEEE) hashes of `"{node}-{replica}"`; when two
//! different nodes land on the same position the lexicographically smaller id
//! keeps it.

use std::collections::{BTreeMap, BTreeSet};

/// Default number of virtual positions per node.
pub const DEFAULT_RING_REPLICAS: usize = 64;

/// Hash function used to place nodes and keys on the ring.
pub type HashFn = fn(&[u8]) -> u32;

#[derive(Clone, Debug)]
pub struct HashRing {
    replicas: usize,
    hash_fn: HashFn,
    positions: BTreeMap<u32, String>,
    nodes: BTreeSet<String>,
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        Self::with_hasher(replicas, crc32fast::hash)
    }

    pub fn with_hasher(replicas: usize, hash_fn: HashFn) -> Self {
        Self {
            replicas: replicas.max(1),
            hash_fn,
            positions: BTreeMap::new(),
            nodes: BTreeSet::new(),
        }
    }

    /// Add nodes and their virtual replicas. Ids already on the ring are
    /// ignored.
    pub fn add_node<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            let id = id.as_ref();
            if id.is_empty() || !self.nodes.insert(id.to_string()) {
                continue;
            }
            self.place(id);
        }
    }

    /// Remove a node. Returns false when it was not on the ring.
    pub fn remove_node(&mut self, id: &str) -> bool {
        if !self.nodes.remove(id) {
            return false;
        }
        // Rebuild so positions the removed node won in a collision go back to
        // the node that lost them.
        self.positions.clear();
        let nodes: Vec<String> = self.nodes.iter().cloned().collect();
        for node in &nodes {
            self.place(node);
        }
        true
    }

    /// Owner of `key`, or `None` if the ring is empty.
    pub fn get_node(&self, key: &[u8]) -> Option<&str> {
        if self.positions.is_empty() {
            return None;
        }
        let hash = (self.hash_fn)(partition_key(key));
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, owner)| owner.as_str())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn place(&mut self, id: &str) {
        for replica in 0..self.replicas {
            let hash = (self.hash_fn)(format!("{id}-{replica}").as_bytes());
            match self.positions.get_mut(&hash) {
                Some(owner) if owner.as_str() <= id => {}
                Some(owner) => *owner = id.to_string(),
                None => {
                    self.positions.insert(hash, id.to_string());
                }
            }
        }
    }
}

/// Part of the key that decides placement.
///
/// A non-empty `{tag}` section pins the key to the tag's owner, so keys like
/// `{user1}:name` and `{user1}:email` always live on the same node.
pub fn partition_key(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|b| *b == b'{') else {
        return key;
    };
    let rest = &key[open + 1..];
    match rest.iter().position(|b| *b == b'}') {
        Some(close) if close > 0 => &rest[..close],
        _ => key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("key:{i}").into_bytes()).collect()
    }

    fn owners(ring: &HashRing, keys: &[Vec<u8>]) -> Vec<String> {
        keys.iter()
            .map(|k| ring.get_node(k).unwrap().to_string())
            .collect()
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = HashRing::new(DEFAULT_RING_REPLICAS);
        assert_eq!(ring.get_node(b"anything"), None);
    }

    #[test]
    fn lookup_is_stable_and_order_independent() {
        let mut a = HashRing::new(DEFAULT_RING_REPLICAS);
        a.add_node(["10.0.0.1:6399", "10.0.0.2:6399", "10.0.0.3:6399"]);
        let mut b = HashRing::new(DEFAULT_RING_REPLICAS);
        b.add_node(["10.0.0.3:6399"]);
        b.add_node(["10.0.0.1:6399", "10.0.0.2:6399"]);

        let keys = keys(2_000);
        let first = owners(&a, &keys);
        assert_eq!(first, owners(&a, &keys));
        assert_eq!(first, owners(&b, &keys));
    }

    #[test]
    fn add_node_is_idempotent() {
        let mut ring = HashRing::new(8);
        ring.add_node(["a", "b"]);
        let before = owners(&ring, &keys(500));
        ring.add_node(["a", "b", "a"]);
        assert_eq!(ring.len(), 2);
        assert_eq!(before, owners(&ring, &keys(500)));
    }

    #[test]
    fn adding_a_node_only_moves_keys_to_it() {
        let mut ring = HashRing::new(DEFAULT_RING_REPLICAS);
        ring.add_node(["n1", "n2", "n3", "n4"]);
        let keys = keys(10_000);
        let before = owners(&ring, &keys);

        ring.add_node(["n5"]);
        let after = owners(&ring, &keys);

        let mut moved = 0;
        for (old, new) in before.iter().zip(&after) {
            if old != new {
                assert_eq!(new, "n5", "key moved between existing nodes");
                moved += 1;
            }
        }
        // Expected share is 1/5; allow generous slack for hash variance.
        assert!(moved > 0);
        assert!(moved < keys.len() * 35 / 100, "moved {moved} keys");
    }

    #[test]
    fn removing_a_node_only_moves_its_keys() {
        let mut ring = HashRing::new(DEFAULT_RING_REPLICAS);
        ring.add_node(["n1", "n2", "n3"]);
        let keys = keys(5_000);
        let before = owners(&ring, &keys);

        assert!(ring.remove_node("n2"));
        assert!(!ring.remove_node("n2"));
        let after = owners(&ring, &keys);
        for (old, new) in before.iter().zip(&after) {
            if old != "n2" {
                assert_eq!(old, new);
            } else {
                assert_ne!(new, "n2");
            }
        }
    }

    #[test]
    fn collisions_resolve_to_smallest_id() {
        fn constant(_: &[u8]) -> u32 {
            7
        }
        let mut a = HashRing::with_hasher(1, constant);
        a.add_node(["b", "a"]);
        let mut b = HashRing::with_hasher(1, constant);
        b.add_node(["a", "b"]);
        assert_eq!(a.get_node(b"k"), Some("a"));
        assert_eq!(b.get_node(b"k"), Some("a"));

        a.remove_node("a");
        assert_eq!(a.get_node(b"k"), Some("b"));
    }

    #[test]
    fn hash_tags_pin_placement() {
        assert_eq!(partition_key(b"{user1}:name"), b"user1");
        assert_eq!(partition_key(b"plain"), b"plain");
        assert_eq!(partition_key(b"{}empty"), b"{}empty");
        assert_eq!(partition_key(b"open{only"), b"open{only");

        let mut ring = HashRing::new(DEFAULT_RING_REPLICAS);
        ring.add_node(["n1", "n2", "n3"]);
        assert_eq!(
            ring.get_node(b"{user1}:name"),
            ring.get_node(b"{user1}:email")
        );
    }
}

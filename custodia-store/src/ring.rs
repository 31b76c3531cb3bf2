//! Consistent hash ring for in-domain placement.
//!
//! Each physical node contributes a fixed number of virtual points on a
//! 64-bit ring; an object key maps to the first point clockwise from its own
//! hash. Adding or removing one node in an N-node domain remaps roughly 1/N
//! of the keys, which is what makes membership changes cheap compared to
//! modulo placement.

use std::collections::{BTreeMap, BTreeSet};

/// Immutable ring over one fault domain's membership. Rebuilt (never
/// mutated) whenever the topology snapshot is rebuilt.
#[derive(Debug, Clone)]
pub struct HashRing {
    points: BTreeMap<u64, String>,
    nodes: BTreeSet<String>,
}

impl HashRing {
    /// Build a ring with `virtual_nodes` points per member. Virtual point
    /// keys use the `"{node}#{index}"` format.
    pub fn build<'a>(members: impl IntoIterator<Item = &'a String>, virtual_nodes: usize) -> Self {
        let mut points = BTreeMap::new();
        let mut nodes = BTreeSet::new();
        let virtual_nodes = virtual_nodes.max(1);

        for member in members {
            if member.is_empty() {
                continue;
            }
            nodes.insert(member.clone());
            for index in 0..virtual_nodes {
                let point = point_hash(&format!("{}#{}", member, index));
                points.insert(point, member.clone());
            }
        }

        Self { points, nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// The node owning `key`: first ring point at or after the key's hash,
    /// wrapping to the start of the ring.
    pub fn primary(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = point_hash(key);
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, node)| node.as_str())
    }

    /// All distinct nodes in ring order starting from `key`'s position.
    /// Used for read failover: try the primary, then its successors.
    pub fn candidates(&self, key: &str) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut result = Vec::with_capacity(self.nodes.len());
        if self.points.is_empty() {
            return result;
        }

        let hash = point_hash(key);
        let walk = self
            .points
            .range(hash..)
            .chain(self.points.range(..hash));
        for (_, node) in walk {
            if seen.insert(node.as_str()) {
                result.push(node.as_str());
                if result.len() == self.nodes.len() {
                    break;
                }
            }
        }
        result
    }

    /// First candidate satisfying `accept`, walking clockwise from `key`.
    /// The walk is bounded by the domain size, so an all-rejected domain
    /// yields `None` rather than looping.
    pub fn primary_where(&self, key: &str, accept: impl Fn(&str) -> bool) -> Option<&str> {
        self.candidates(key).into_iter().find(|node| accept(node))
    }
}

/// 64-bit ring point: the leading 8 bytes of the MD5 digest, big-endian.
/// MD5 is used for distribution only, not integrity.
fn point_hash(key: &str) -> u64 {
    let digest = md5::compute(key.as_bytes());
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

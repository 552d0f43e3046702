use crate::core::NodeId;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use wyhash::{wyrng, WyHash};

/// Fixed-membership consistent-hash ring. Each node owns `vnodes` points;
/// extra points are chained off the first with `wyrng` so placement is
/// deterministic for a given node set.
#[derive(Clone, Debug)]
pub struct NodeRing {
  ring: BTreeMap<u64, NodeId>,
}
impl NodeRing {
  pub fn new(nodes: &[NodeId], vnodes: u32) -> NodeRing {
    let mut ring = BTreeMap::new();
    for node in nodes {
      let mut key = hash_code(node);
      ring.insert(key, *node);
      for _ in 1..vnodes.max(1) {
        key = wyrng(&mut key);
        ring.insert(key, *node);
      }
    }
    NodeRing { ring: ring }
  }

  /// The first `k` distinct nodes clockwise from the key's point.
  pub fn pref(&self, key: &[u8], k: usize) -> Vec<NodeId> {
    let point = hash_code(&key);
    self
      .ring
      .range(point..)
      .chain(self.ring.range(..point))
      .map(|(_, id)| *id)
      .unique()
      .take(k)
      .collect()
  }
}

fn hash_code<H: Hash>(item: &H) -> u64 {
  let mut hasher = WyHash::with_seed(0);
  item.hash(&mut hasher);
  hasher.finish()
}

#[test]
fn test_pref_is_deterministic() {
  let nodes = (1..=5).map(NodeId).collect::<Vec<_>>();
  let ring = NodeRing::new(&nodes, 3);
  let a = ring.pref(b"some key", 3);
  let b = NodeRing::new(&nodes, 3).pref(b"some key", 3);
  assert_eq!(a, b);
  assert_eq!(3, a.len());
}

#[test]
fn test_pref_distinct_and_bounded() {
  let nodes = (1..=4).map(NodeId).collect::<Vec<_>>();
  let ring = NodeRing::new(&nodes, 4);
  for i in 0..50u32 {
    let key = format!("key-{}", i).into_bytes();
    let pref = ring.pref(&key, 10);
    assert_eq!(4, pref.len());
    assert_eq!(4, pref.iter().unique().count());
  }
}

#[test]
fn test_pref_prefix_stability() {
  // Asking for fewer nodes yields a prefix of the longer walk.
  let nodes = (1..=6).map(NodeId).collect::<Vec<_>>();
  let ring = NodeRing::new(&nodes, 2);
  let long = ring.pref(b"stable", 6);
  for k in 1..=6 {
    assert_eq!(&long[..k], ring.pref(b"stable", k).as_slice());
  }
}

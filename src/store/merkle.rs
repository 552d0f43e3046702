use crate::store::{Value, VectorClock};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Verdict of [`compare_trees`], evaluated on the receiver of a snapshot.
/// `SendFrom(k)` directs the receiver to ship its leaves from index `k`
/// onward back to the sender; leaves left of `k` are known equal.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TreeCmp {
  Same,
  DoNothing,
  SendFrom(usize),
}

/// Append-only binary hash tree over byte-string leaves.
///
/// `matrix[0]` is the ordered sequence of inserted leaves; each higher
/// level holds `H(left ∥ right)` for every pair of children, with a lone
/// left child promoting its own hash upward unchanged, with no synthetic
/// padding. The level at `root_level` always has exactly one element.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct MerkleTree {
  matrix: Vec<Vec<Vec<u8>>>,
  leaf_count: usize,
}
impl MerkleTree {
  pub fn new() -> MerkleTree {
    MerkleTree {
      matrix: Vec::new(),
      leaf_count: 0,
    }
  }

  pub fn leaf_count(&self) -> usize {
    self.leaf_count
  }

  /// Index of the current top level; 0 when the tree is empty or holds a
  /// single leaf.
  pub fn root_level(&self) -> usize {
    self.matrix.len().saturating_sub(1)
  }

  /// `None` while the tree is empty, the single cell of the top level
  /// otherwise.
  pub fn root_hash(&self) -> Option<&[u8]> {
    if self.leaf_count == 0 {
      None
    } else {
      Some(&self.matrix[self.root_level()][0])
    }
  }

  /// Appends a leaf and recomputes the single affected spine, growing a
  /// new top level when the insertion calls for one.
  pub fn insert(&mut self, leaf: &[u8]) {
    if self.matrix.is_empty() {
      self.matrix.push(Vec::new());
    }
    self.matrix[0].push(leaf.to_vec());
    self.leaf_count += 1;
    let mut level = 0;
    while self.matrix[level].len() > 1 {
      let parent = (self.matrix[level].len() - 1) / 2;
      let lo = parent * 2;
      let cell = match self.matrix[level].get(lo + 1) {
        Some(right) => join(&self.matrix[level][lo], right),
        None => self.matrix[level][lo].clone(),
      };
      if level + 1 == self.matrix.len() {
        self.matrix.push(Vec::new());
      }
      let up = &mut self.matrix[level + 1];
      if parent == up.len() {
        up.push(cell);
      } else {
        up[parent] = cell;
      }
      level += 1;
    }
  }
}

/// The divergence protocol. `sender` is the snapshot that arrived over the
/// wire, `receiver` the local one. Height is compared first; at equal
/// heights with differing roots, levels are descended from `root_level - 1`
/// down to the leaves, tracking the highest leaf index implied by the first
/// mismatching column of each level.
pub fn compare_trees(sender: &MerkleTree, receiver: &MerkleTree) -> TreeCmp {
  match (sender.leaf_count, receiver.leaf_count) {
    (0, 0) => return TreeCmp::Same,
    (0, _) => return TreeCmp::SendFrom(0),
    (_, 0) => return TreeCmp::DoNothing,
    _ => {}
  }
  if sender.root_level() > receiver.root_level() {
    return TreeCmp::DoNothing;
  }
  if receiver.root_level() > sender.root_level() {
    return TreeCmp::SendFrom(0);
  }
  if sender.root_hash() == receiver.root_hash() {
    return TreeCmp::Same;
  }
  let mut max = 0;
  for level in (0..sender.root_level()).rev() {
    let s = &sender.matrix[level];
    let r = &receiver.matrix[level];
    let cols = s.len().max(r.len());
    if let Some(col) = (0..cols).find(|&c| s.get(c) != r.get(c)) {
      max = max.max(col << level);
    }
  }
  let s0 = sender.matrix[0].get(max);
  if s0.is_some() && s0 == receiver.matrix[0].get(max) {
    max += 1;
  }
  TreeCmp::SendFrom(max)
}

/// The opaque digest the tree is built over.
pub fn digest(bytes: &[u8]) -> Vec<u8> {
  Md5::digest(bytes).to_vec()
}

fn join(left: &[u8], right: &[u8]) -> Vec<u8> {
  let mut hasher = Md5::new();
  hasher.update(left);
  hasher.update(right);
  hasher.finalize().to_vec()
}

/// Canonical leaf bytes for anti-entropy snapshots:
/// `H(len(key) ∥ key ∥ version pairs ∥ length-prefixed sibling values)`.
/// Snapshots iterate keys in ascending order, so two replicas holding the
/// same `(key, values, version)` sets produce the same root.
pub fn leaf_digest(
  key: &[u8],
  values: &[Value],
  version: &VectorClock,
) -> Vec<u8> {
  let mut buf = Vec::new();
  buf.extend_from_slice(&(key.len() as u64).to_le_bytes());
  buf.extend_from_slice(key);
  for (id, count) in version.iter() {
    buf.extend_from_slice(&id.0.to_le_bytes());
    buf.extend_from_slice(&count.to_le_bytes());
  }
  for value in values {
    buf.extend_from_slice(&(value.len() as u64).to_le_bytes());
    buf.extend_from_slice(value);
  }
  digest(&buf)
}

#[cfg(test)]
fn tree_of(leaves: &[Vec<u8>]) -> MerkleTree {
  let mut tree = MerkleTree::new();
  for leaf in leaves {
    tree.insert(leaf);
  }
  tree
}

#[test]
fn test_empty_root() {
  assert_eq!(None, MerkleTree::new().root_hash());
  assert_eq!(0, MerkleTree::new().root_level());
}

#[test]
fn test_five_leaf_shape() {
  let leaves = vec![
    digest(b"HI"),
    digest(b"I AM YIN"),
    digest(b"THIS IS DIST SYS"),
    digest(b"PROJECT DYNAMO"),
    digest(&[12, 23, 45, 56]),
  ];
  let tree = tree_of(&leaves);
  assert_eq!(5, tree.leaf_count());
  assert_eq!(3, tree.root_level());
  let left = join(&join(&leaves[0], &leaves[1]), &join(&leaves[2], &leaves[3]));
  let expected = join(&left, &leaves[4]);
  assert_eq!(Some(expected.as_slice()), tree.root_hash());
}

#[test]
fn test_shape_invariants() {
  let leaves = (0u8..11).map(|i| digest(&[i])).collect::<Vec<_>>();
  for n in 1..=leaves.len() {
    let tree = tree_of(&leaves[..n]);
    assert_eq!(n, tree.leaf_count());
    assert_eq!(n, tree.matrix[0].len());
    assert_eq!(1, tree.matrix[tree.root_level()].len());
    assert_eq!((n as f64).log2().ceil() as usize, tree.root_level());
  }
}

#[test]
fn test_single_leaf_promotes_to_root() {
  let tree = tree_of(&[digest(b"only")]);
  assert_eq!(0, tree.root_level());
  assert_eq!(Some(digest(b"only").as_slice()), tree.root_hash());
}

#[test]
fn test_compare_same() {
  assert_eq!(
    TreeCmp::Same,
    compare_trees(&MerkleTree::new(), &MerkleTree::new())
  );
  let leaves = (0u8..7).map(|i| digest(&[i])).collect::<Vec<_>>();
  let tree = tree_of(&leaves);
  assert_eq!(TreeCmp::Same, compare_trees(&tree, &tree.clone()));
}

#[test]
fn test_compare_empty_sides() {
  let tree = tree_of(&[digest(b"x"), digest(b"y")]);
  assert_eq!(TreeCmp::SendFrom(0), compare_trees(&MerkleTree::new(), &tree));
  assert_eq!(TreeCmp::DoNothing, compare_trees(&tree, &MerkleTree::new()));
}

#[test]
fn test_compare_heights() {
  let leaves = (0u8..8).map(|i| digest(&[i])).collect::<Vec<_>>();
  let short = tree_of(&leaves[..2]);
  let tall = tree_of(&leaves);
  assert_eq!(TreeCmp::DoNothing, compare_trees(&tall, &short));
  assert_eq!(TreeCmp::SendFrom(0), compare_trees(&short, &tall));
}

#[test]
fn test_compare_finds_divergence_index() {
  let leaves = (0u8..8).map(|i| digest(&[i])).collect::<Vec<_>>();
  let sender = tree_of(&leaves);
  // Same prefix, receiver diverges from leaf 5 onward.
  let mut altered = leaves.clone();
  altered[5] = digest(b"changed");
  let receiver = tree_of(&altered);
  assert_eq!(TreeCmp::SendFrom(5), compare_trees(&sender, &receiver));
}

#[test]
fn test_compare_receiver_has_extra_leaf() {
  let leaves = (0u8..6).map(|i| digest(&[i])).collect::<Vec<_>>();
  let sender = tree_of(&leaves[..5]);
  let receiver = tree_of(&leaves);
  // Heights are equal at 3; the shared prefix matches, so only the tail
  // needs to travel.
  assert_eq!(TreeCmp::SendFrom(5), compare_trees(&sender, &receiver));
}

use crate::core::NodeId;
use itertools::EitherOrBoth::{Both, Left, Right};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Partial-order verdict between two clocks or contexts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClockOrd {
  Before,
  After,
  Concurrent,
}

/// Per-writer counter map; a missing entry counts as zero. Equal clocks,
/// two empty ones included, compare `Concurrent`. The coordinator relies
/// on this: independently initialized writes become siblings unless one
/// explicitly descends the other.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct VectorClock {
  counts: BTreeMap<NodeId, u64>,
}
impl VectorClock {
  pub fn new() -> VectorClock {
    VectorClock {
      counts: BTreeMap::new(),
    }
  }

  pub fn get(&self, id: NodeId) -> u64 {
    self.counts.get(&id).copied().unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.counts.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
    self.counts.iter()
  }

  /// The only way a node advances a clock, and only ever its own component.
  pub fn tick(&mut self, id: NodeId) {
    *self.counts.entry(id).or_insert(0) += 1;
  }

  /// Pointwise maximum. Commutative, associative, idempotent.
  pub fn combine(&self, other: &VectorClock) -> VectorClock {
    let counts = self
      .counts
      .iter()
      .merge_join_by(other.counts.iter(), |a, b| a.0.cmp(b.0))
      .map(|pair| match pair {
        Both((id, a), (_, b)) => (*id, *a.max(b)),
        Left((id, a)) => (*id, *a),
        Right((id, b)) => (*id, *b),
      })
      .collect();
    VectorClock { counts: counts }
  }

  /// Defined over the union of keys, absent = 0.
  pub fn compare(&self, other: &VectorClock) -> ClockOrd {
    let mut less = false;
    let mut greater = false;
    for pair in self
      .counts
      .iter()
      .merge_join_by(other.counts.iter(), |a, b| a.0.cmp(b.0))
    {
      match pair {
        Both((_, a), (_, b)) => {
          less |= a < b;
          greater |= a > b;
        }
        Left((_, a)) => greater |= *a > 0,
        Right((_, b)) => less |= *b > 0,
      }
    }
    match (less, greater) {
      (true, false) => ClockOrd::Before,
      (false, true) => ClockOrd::After,
      _ => ClockOrd::Concurrent,
    }
  }
}

/// A vector clock plus an optional hint: the node the write was originally
/// intended for, when that node was dead at write time.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Context {
  pub version: VectorClock,
  pub hint: Option<NodeId>,
}
impl Context {
  pub fn compare(&self, other: &Context) -> ClockOrd {
    self.version.compare(&other.version)
  }

  /// If one strictly precedes the other, keep the later; otherwise combine
  /// the clocks and keep whichever hint is non-null, left-biased.
  pub fn combine(&self, other: &Context) -> Context {
    match self.compare(other) {
      ClockOrd::Before => other.clone(),
      ClockOrd::After => self.clone(),
      ClockOrd::Concurrent => Context {
        version: self.version.combine(&other.version),
        hint: self.hint.or(other.hint),
      },
    }
  }

  pub fn without_hint(&self) -> Context {
    Context {
      version: self.version.clone(),
      hint: None,
    }
  }
}

#[cfg(test)]
fn vc(entries: &[(u64, u64)]) -> VectorClock {
  let mut clock = VectorClock::new();
  for (id, count) in entries {
    for _ in 0..*count {
      clock.tick(NodeId(*id));
    }
  }
  clock
}

#[test]
fn test_tick_advances_one_component() {
  let mut clock = vc(&[(1, 2), (2, 5)]);
  clock.tick(NodeId(1));
  assert_eq!(3, clock.get(NodeId(1)));
  assert_eq!(5, clock.get(NodeId(2)));
  assert_eq!(0, clock.get(NodeId(7)));
}

#[test]
fn test_combine_laws() {
  let a = vc(&[(1, 2), (2, 1)]);
  let b = vc(&[(2, 4), (3, 1)]);
  assert_eq!(a, a.combine(&a));
  assert_eq!(a.combine(&b), b.combine(&a));
  assert_eq!(vc(&[(1, 2), (2, 4), (3, 1)]), a.combine(&b));
}

#[test]
fn test_compare_mirrors() {
  let cases = vec![
    (vc(&[]), vc(&[])),
    (vc(&[(1, 1)]), vc(&[(1, 2)])),
    (vc(&[(1, 22)]), vc(&[(2, 66)])),
    (vc(&[(1, 1), (2, 2)]), vc(&[(1, 2), (2, 1)])),
    (vc(&[(1, 1)]), vc(&[(1, 1), (2, 1)])),
  ];
  for (a, b) in cases {
    let expected = match a.compare(&b) {
      ClockOrd::Before => ClockOrd::After,
      ClockOrd::After => ClockOrd::Before,
      ClockOrd::Concurrent => ClockOrd::Concurrent,
    };
    assert_eq!(expected, b.compare(&a));
  }
}

#[test]
fn test_equal_clocks_are_concurrent() {
  assert_eq!(ClockOrd::Concurrent, vc(&[]).compare(&vc(&[])));
  let a = vc(&[(1, 3), (2, 1)]);
  assert_eq!(ClockOrd::Concurrent, a.compare(&a.clone()));
}

#[test]
fn test_compare_orders() {
  assert_eq!(ClockOrd::Before, vc(&[(1, 1)]).compare(&vc(&[(1, 2)])));
  assert_eq!(
    ClockOrd::After,
    vc(&[(1, 2), (2, 1)]).compare(&vc(&[(1, 1)]))
  );
  assert_eq!(
    ClockOrd::Concurrent,
    vc(&[(1, 22)]).compare(&vc(&[(2, 66)]))
  );
}

#[test]
fn test_context_combine_keeps_hint() {
  let a = Context {
    version: vc(&[(1, 1)]),
    hint: None,
  };
  let b = Context {
    version: vc(&[(2, 1)]),
    hint: Some(NodeId(9)),
  };
  let merged = a.combine(&b);
  assert_eq!(vc(&[(1, 1), (2, 1)]), merged.version);
  assert_eq!(Some(NodeId(9)), merged.hint);

  let later = Context {
    version: vc(&[(1, 1), (2, 2)]),
    hint: None,
  };
  assert_eq!(later, b.combine(&later));
}

#[test]
fn test_context_combine_left_bias() {
  let a = Context {
    version: vc(&[(1, 1)]),
    hint: Some(NodeId(4)),
  };
  let b = Context {
    version: vc(&[(2, 1)]),
    hint: Some(NodeId(5)),
  };
  assert_eq!(Some(NodeId(4)), a.combine(&b).hint);
  assert_eq!(Some(NodeId(5)), b.combine(&a).hint);
}

use crate::core::NodeId;
use crate::store::{ClientRequest, Context, Key, Nonce, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// An in-flight coordinator read. `requested` is every node the request
/// went to, self included; responses only count from that set.
pub(crate) struct PendingGet {
  pub client: NodeId,
  pub key: Key,
  pub responses: HashMap<NodeId, (Vec<Value>, Context)>,
  pub requested: HashSet<NodeId>,
}

/// An in-flight coordinator write. The coordinator applied the write
/// locally before this entry existed, so quorum is met at `w - 1` peer
/// acknowledgements. `requested` remembers the hint each peer was sent
/// with; `last_requested_index` walks monotonically through the ring so
/// retries never revisit a candidate.
pub(crate) struct PendingPut {
  pub client: NodeId,
  pub key: Key,
  pub value: Value,
  pub context: Context,
  pub responses: HashSet<NodeId>,
  pub requested: HashMap<NodeId, Option<NodeId>>,
  pub last_requested_index: usize,
}

/// A client request forwarded to a live coordinator, awaiting its
/// acknowledgement.
pub(crate) struct PendingRedirect {
  pub client: NodeId,
  pub request: ClientRequest,
}

/// The per-nonce queues of an active replica. Lost wholesale on crash.
#[derive(Default)]
pub(crate) struct Trackers {
  pub gets: HashMap<Nonce, PendingGet>,
  pub puts: HashMap<Nonce, PendingPut>,
  pub redirects: HashMap<Nonce, PendingRedirect>,
  /// target node -> nonce -> the contexts in flight to it.
  pub handoffs: HashMap<NodeId, HashMap<Nonce, BTreeMap<Key, Context>>>,
}
impl Trackers {
  pub fn insert_get(&mut self, nonce: Nonce, pending: PendingGet) {
    if self.gets.insert(nonce, pending).is_some() {
      panic!("duplicate request nonce {}", nonce);
    }
  }

  pub fn insert_put(&mut self, nonce: Nonce, pending: PendingPut) {
    if self.puts.insert(nonce, pending).is_some() {
      panic!("duplicate request nonce {}", nonce);
    }
  }

  pub fn insert_redirect(&mut self, nonce: Nonce, pending: PendingRedirect) {
    if self.redirects.insert(nonce, pending).is_some() {
      panic!("duplicate request nonce {}", nonce);
    }
  }
}

#[cfg(test)]
fn get_entry() -> PendingGet {
  PendingGet {
    client: NodeId(90),
    key: b"k".to_vec(),
    responses: HashMap::new(),
    requested: HashSet::new(),
  }
}

#[test]
#[should_panic(expected = "duplicate request nonce")]
fn test_duplicate_get_nonce_is_fatal() {
  let mut trackers = Trackers::default();
  trackers.insert_get(7, get_entry());
  trackers.insert_get(7, get_entry());
}

#[test]
#[should_panic(expected = "duplicate request nonce")]
fn test_duplicate_put_nonce_is_fatal() {
  let mut trackers = Trackers::default();
  let entry = || PendingPut {
    client: NodeId(90),
    key: b"k".to_vec(),
    value: b"v".to_vec(),
    context: Context::default(),
    responses: HashSet::new(),
    requested: HashMap::new(),
    last_requested_index: 0,
  };
  trackers.insert_put(9, entry());
  trackers.insert_put(9, entry());
}

#[test]
fn test_distinct_nonces_coexist() {
  let mut trackers = Trackers::default();
  trackers.insert_get(1, get_entry());
  trackers.insert_get(2, get_entry());
  assert_eq!(2, trackers.gets.len());
}

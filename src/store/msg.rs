use crate::core::NodeId;
use crate::store::{Context, MerkleTree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;
/// Per-request correlator: `(node ordinal << 32) | per-node counter`, so
/// two principals can never collide. Duplicate nonces are still treated as
/// a fatal invariant violation wherever trackers are keyed by them.
pub type Nonce = u64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub enum ReqKind {
  Get,
  Put,
}

/// The two client operations, as they appear both at the edge node and
/// inside a [`StoreMsg::RedirectedClientRequest`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum ClientRequest {
  Get {
    nonce: Nonce,
    key: Key,
  },
  Put {
    nonce: Nonce,
    key: Key,
    value: Value,
    context: Context,
  },
}
impl ClientRequest {
  pub fn nonce(&self) -> Nonce {
    match self {
      ClientRequest::Get { nonce, .. } => *nonce,
      ClientRequest::Put { nonce, .. } => *nonce,
    }
  }

  pub fn key(&self) -> &Key {
    match self {
      ClientRequest::Get { key, .. } => key,
      ClientRequest::Put { key, .. } => key,
    }
  }

  pub fn kind(&self) -> ReqKind {
    match self {
      ClientRequest::Get { .. } => ReqKind::Get,
      ClientRequest::Put { .. } => ReqKind::Put,
    }
  }
}

/// Snapshot of a replica's entire state, returned by
/// [`StoreMsg::GetStateRequest`]. Tests only.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
pub struct StateSnapshot {
  pub store: BTreeMap<Key, (Vec<Value>, Context)>,
  pub alive: BTreeMap<NodeId, bool>,
}

/// Everything that crosses the bus, plus the timer tags a node sends to
/// itself. Exhaustive matching in the replica makes an unhandled inbound
/// message unrepresentable.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum StoreMsg {
  // client <-> node
  ClientGetRequest {
    nonce: Nonce,
    key: Key,
  },
  ClientGetResponse {
    nonce: Nonce,
    success: bool,
    values: Option<Vec<Value>>,
    context: Option<Context>,
  },
  ClientPutRequest {
    nonce: Nonce,
    key: Key,
    value: Value,
    context: Context,
  },
  ClientPutResponse {
    nonce: Nonce,
    success: bool,
    value: Option<Value>,
    context: Option<Context>,
  },
  // node <-> node
  CoordinatorGetRequest {
    nonce: Nonce,
    key: Key,
  },
  CoordinatorGetResponse {
    nonce: Nonce,
    values: Vec<Value>,
    context: Context,
  },
  CoordinatorPutRequest {
    nonce: Nonce,
    key: Key,
    value: Value,
    context: Context,
  },
  CoordinatorPutResponse {
    nonce: Nonce,
  },
  RedirectedClientRequest {
    client: NodeId,
    request: ClientRequest,
  },
  RedirectAcknowledgement {
    nonce: Nonce,
  },
  HandoffRequest {
    nonce: Nonce,
    data: Vec<(Key, Vec<Value>, Context)>,
  },
  HandoffResponse {
    nonce: Nonce,
  },
  AliveCheckRequest,
  AliveCheckResponse,
  SyncRequest {
    nonce: Nonce,
    tree: MerkleTree,
  },
  SyncPush {
    nonce: Nonce,
    entries: Vec<(Key, Vec<Value>, Context)>,
  },
  Crash,
  Recover,
  GetStateRequest {
    nonce: Nonce,
  },
  GetStateResponse {
    nonce: Nonce,
    state: StateSnapshot,
  },
  // timers, self-sent
  ClientTimeout {
    kind: ReqKind,
    nonce: Nonce,
  },
  CoordinatorRequestTimeout {
    kind: ReqKind,
    nonce: Nonce,
    peer: NodeId,
  },
  RedirectTimeout {
    nonce: Nonce,
    failed_coord: NodeId,
  },
  HandoffTimeout {
    nonce: Nonce,
    peer: NodeId,
  },
  HealthCheckTimeout {
    epoch: u64,
  },
  MerkleSyncTimeout {
    epoch: u64,
  },
}

use crate::core::{Actor, ActorContext, Envelope, NodeId};
use crate::store::tracker::{
  PendingGet, PendingPut, PendingRedirect, Trackers,
};
use crate::store::{
  compare_trees, leaf_digest, ClientRequest, ClockOrd, ConfigError, Context,
  Key, MerkleTree, Nonce, NodeRing, ReqKind, StateSnapshot, StoreConfig,
  StoreMsg, TreeCmp, Value, LOG_LEVEL,
};
use crate::{debug, info};
use async_trait::async_trait;
use itertools::Itertools;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use StoreMsg::*;

/// What a replica holds for one key: the pairwise-concurrent sibling
/// payloads and their combined context.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Stored {
  pub values: Vec<Value>,
  pub ctx: Context,
}

/// Reconciliation rule for two versions of the same key: a strictly older
/// side is dropped; concurrent sides keep the sorted, deduplicated union
/// of their payloads under the combined context.
pub fn merge_values(
  a: (Vec<Value>, Context),
  b: (Vec<Value>, Context),
) -> (Vec<Value>, Context) {
  match a.1.compare(&b.1) {
    ClockOrd::Before => b,
    ClockOrd::After => a,
    ClockOrd::Concurrent => {
      let values =
        a.0.into_iter().chain(b.0).sorted().dedup().collect::<Vec<_>>();
      (values, a.1.combine(&b.1))
    }
  }
}

/// State that survives simulated crashes: identity, configuration, the
/// ring (membership is fixed), the timer epoch, and the nonce counter.
pub(crate) struct Common {
  pub id: NodeId,
  pub config: StoreConfig,
  pub ring: NodeRing,
  pub peers: Vec<NodeId>,
  epoch: u64,
  nonce_counter: u64,
}
impl Common {
  fn gen_nonce(&mut self) -> Nonce {
    self.nonce_counter += 1;
    (self.id.0 << 32) | (self.nonce_counter & 0xffff_ffff)
  }
}

pub(crate) enum Phase {
  Up(NodeState),
  Crashed,
}

/// Everything lost wholesale on crash: the store, the liveness map, and
/// the pending-request trackers.
pub(crate) struct NodeState {
  pub store: BTreeMap<Key, Stored>,
  pub alive: HashMap<NodeId, bool>,
  pub trackers: Trackers,
}

pub struct Replica {
  pub(crate) common: Common,
  pub(crate) phase: Phase,
}
impl Replica {
  /// Seeds `initial_data` filtered to the keys this node owns, marks every
  /// peer alive, and validates the quorum parameters.
  pub fn new(
    id: NodeId,
    initial_data: BTreeMap<Key, Value>,
    nodes: &[NodeId],
    config: StoreConfig,
  ) -> Result<Replica, ConfigError> {
    config.validate()?;
    let ring = NodeRing::new(nodes, config.vnodes);
    let peers = nodes
      .iter()
      .copied()
      .filter(|p| *p != id)
      .collect::<Vec<_>>();
    let mut state = NodeState::fresh(&peers);
    for (key, value) in initial_data {
      if ring.pref(&key, config.n).contains(&id) {
        state.store.insert(
          key,
          Stored {
            values: vec![value],
            ctx: Context::default(),
          },
        );
      }
    }
    Ok(Replica {
      common: Common {
        id: id,
        config: config,
        ring: ring,
        peers: peers,
        epoch: 0,
        nonce_counter: 0,
      },
      phase: Phase::Up(state),
    })
  }

  fn arm_periodic(&self, ctx: &ActorContext<StoreMsg>) {
    ctx.net.schedule_local_msg(
      self.common.config.health_check_interval,
      ctx.local_interface(),
      HealthCheckTimeout {
        epoch: self.common.epoch,
      },
    );
    ctx.net.schedule_local_msg(
      self.common.config.merkle_sync_interval,
      ctx.local_interface(),
      MerkleSyncTimeout {
        epoch: self.common.epoch,
      },
    );
  }
}

#[async_trait]
impl Actor<StoreMsg> for Replica {
  async fn pre_start(&mut self, ctx: &ActorContext<StoreMsg>) {
    self.arm_periodic(ctx);
  }

  async fn recv(&mut self, ctx: &ActorContext<StoreMsg>, env: Envelope<StoreMsg>) {
    let Envelope { from, msg } = env;
    match msg {
      Crash => {
        if let Phase::Up(_) = self.phase {
          info!(LOG_LEVEL, ctx, "crashing, state discarded".to_string());
          self.phase = Phase::Crashed;
        }
      }
      Recover => {
        if let Phase::Crashed = self.phase {
          info!(LOG_LEVEL, ctx, "recovering with empty state".to_string());
          self.common.epoch += 1;
          self.phase = Phase::Up(NodeState::fresh(&self.common.peers));
          self.arm_periodic(ctx);
        }
      }
      // A crashed node drops everything else on the floor.
      other => {
        if let Phase::Up(state) = &mut self.phase {
          state.process(&mut self.common, ctx, from, other);
        }
      }
    }
  }
}

impl NodeState {
  fn fresh(peers: &[NodeId]) -> NodeState {
    NodeState {
      store: BTreeMap::new(),
      alive: peers.iter().map(|p| (*p, true)).collect(),
      trackers: Trackers::default(),
    }
  }

  fn process(
    &mut self,
    common: &mut Common,
    ctx: &ActorContext<StoreMsg>,
    from: NodeId,
    msg: StoreMsg,
  ) {
    match msg {
      ClientGetRequest { nonce, key } => {
        self.client_request(
          common,
          ctx,
          from,
          ClientRequest::Get {
            nonce: nonce,
            key: key,
          },
        );
      }
      ClientPutRequest {
        nonce,
        key,
        value,
        context,
      } => {
        self.client_request(
          common,
          ctx,
          from,
          ClientRequest::Put {
            nonce: nonce,
            key: key,
            value: value,
            context: context,
          },
        );
      }
      RedirectedClientRequest { client, request } => {
        self.mark_alive(common, ctx, from);
        ctx.net.send(
          common.id,
          from,
          &RedirectAcknowledgement {
            nonce: request.nonce(),
          },
        );
        self.coordinate(common, ctx, client, request);
      }
      RedirectAcknowledgement { nonce } => {
        self.mark_alive(common, ctx, from);
        self.trackers.redirects.remove(&nonce);
      }
      CoordinatorGetRequest { nonce, key } => {
        self.mark_alive(common, ctx, from);
        let (values, read_ctx) = self.local_get(&key);
        ctx.net.send(
          common.id,
          from,
          &CoordinatorGetResponse {
            nonce: nonce,
            values: values,
            context: read_ctx.without_hint(),
          },
        );
      }
      CoordinatorGetResponse {
        nonce,
        values,
        context,
      } => {
        self.mark_alive(common, ctx, from);
        self.record_get_response(common, ctx, nonce, from, values, context);
      }
      CoordinatorPutRequest {
        nonce,
        key,
        value,
        context,
      } => {
        self.mark_alive(common, ctx, from);
        let hint = context.hint;
        self.local_put(key, vec![value], context);
        ctx.net.send(common.id, from, &CoordinatorPutResponse { nonce: nonce });
        if let Some(h) = hint {
          if h != common.id && self.is_alive(h) {
            self.attempt_handoff(common, ctx, h);
          }
        }
      }
      CoordinatorPutResponse { nonce } => {
        self.mark_alive(common, ctx, from);
        self.record_put_ack(common, ctx, nonce, from);
      }
      HandoffRequest { nonce, data } => {
        self.mark_alive(common, ctx, from);
        for (key, values, hctx) in data {
          self.local_put(key, values, hctx);
        }
        ctx.net.send(common.id, from, &HandoffResponse { nonce: nonce });
      }
      HandoffResponse { nonce } => {
        self.mark_alive(common, ctx, from);
        self.complete_handoff(from, nonce);
      }
      AliveCheckRequest => {
        self.mark_alive(common, ctx, from);
        ctx.net.send(common.id, from, &AliveCheckResponse);
      }
      AliveCheckResponse => {
        self.mark_alive(common, ctx, from);
      }
      SyncRequest { nonce, tree } => {
        self.mark_alive(common, ctx, from);
        self.answer_sync(common, ctx, from, nonce, tree);
      }
      SyncPush { nonce: _, entries } => {
        self.mark_alive(common, ctx, from);
        for (key, values, sctx) in entries {
          self.local_put(key, values, sctx);
        }
      }
      GetStateRequest { nonce } => {
        ctx.net.send(
          common.id,
          from,
          &GetStateResponse {
            nonce: nonce,
            state: self.snapshot(),
          },
        );
      }
      ClientTimeout { kind, nonce } => {
        self.client_timeout(common, ctx, kind, nonce);
      }
      CoordinatorRequestTimeout { kind, nonce, peer } => {
        self.request_timeout(common, ctx, kind, nonce, peer);
      }
      RedirectTimeout {
        nonce,
        failed_coord,
      } => {
        self.redirect_timeout(common, ctx, nonce, failed_coord);
      }
      HandoffTimeout { nonce, peer } => {
        self.handoff_timeout(nonce, peer);
      }
      HealthCheckTimeout { epoch } => {
        self.health_check(common, ctx, epoch);
      }
      MerkleSyncTimeout { epoch } => {
        self.merkle_sync(common, ctx, epoch);
      }
      Crash | Recover => unreachable!("handled before dispatch"),
      ClientGetResponse { .. }
      | ClientPutResponse { .. }
      | GetStateResponse { .. } => {
        panic!("replica {} received a client-bound message", common.id);
      }
    }
  }

  // ---------------------------------------------------------------------
  // preference & liveness
  // ---------------------------------------------------------------------

  fn is_alive(&self, node: NodeId) -> bool {
    self.alive.get(&node).copied().unwrap_or(false)
  }

  fn self_or_alive(&self, common: &Common, node: NodeId) -> bool {
    node == common.id || self.is_alive(node)
  }

  fn preference(&self, common: &Common, key: &[u8]) -> Vec<NodeId> {
    common.ring.pref(key, common.config.n)
  }

  fn is_coordinator(&self, common: &Common, key: &[u8]) -> bool {
    self.preference(common, key).contains(&common.id)
  }

  fn first_alive_coordinator(
    &self,
    common: &Common,
    key: &[u8],
  ) -> Option<NodeId> {
    self
      .preference(common, key)
      .into_iter()
      .find(|c| self.self_or_alive(common, *c))
  }

  /// Ring walk long enough to always surface `n` live candidates if any
  /// exist: `|alive| + 1` distinct nodes covers the whole cluster.
  fn ring_walk(&self, common: &Common, key: &[u8]) -> Vec<NodeId> {
    common.ring.pref(key, self.alive.len() + 1)
  }

  fn alive_preference(&self, common: &Common, key: &[u8]) -> Vec<NodeId> {
    self
      .ring_walk(common, key)
      .into_iter()
      .filter(|c| self.self_or_alive(common, *c))
      .take(common.config.n)
      .collect()
  }

  /// The live targets of a write, each paired with the dead natural owner
  /// it stands in for, if any. Substitutes are zipped to dead owners in
  /// order of appearance. Also yields the walk index of the last target,
  /// the starting point for retries.
  fn alive_preference_with_hints(
    &self,
    common: &Common,
    key: &[u8],
  ) -> (Vec<(NodeId, Option<NodeId>)>, usize) {
    let walk = self.ring_walk(common, key);
    let natural = walk
      .iter()
      .copied()
      .take(common.config.n)
      .collect::<Vec<_>>();
    let mut dead_naturals = natural
      .iter()
      .copied()
      .filter(|c| !self.self_or_alive(common, *c));
    let mut out = Vec::new();
    let mut last = 0;
    for (i, node) in walk
      .iter()
      .copied()
      .enumerate()
      .filter(|(_, c)| self.self_or_alive(common, *c))
      .take(common.config.n)
    {
      let hint = if natural.contains(&node) {
        None
      } else {
        dead_naturals.next()
      };
      out.push((node, hint));
      last = i;
    }
    (out, last)
  }

  fn mark_alive(
    &mut self,
    common: &mut Common,
    ctx: &ActorContext<StoreMsg>,
    node: NodeId,
  ) {
    match self.alive.get_mut(&node) {
      Some(up) if !*up => {
        *up = true;
        info!(LOG_LEVEL, ctx, format!("{} is back up", node));
        self.attempt_handoff(common, ctx, node);
      }
      _ => {}
    }
  }

  fn mark_dead(&mut self, node: NodeId) {
    if let Some(up) = self.alive.get_mut(&node) {
      *up = false;
    }
  }

  // ---------------------------------------------------------------------
  // local store
  // ---------------------------------------------------------------------

  fn local_get(&self, key: &[u8]) -> (Vec<Value>, Context) {
    match self.store.get(key) {
      Some(stored) => (stored.values.clone(), stored.ctx.clone()),
      None => (Vec::new(), Context::default()),
    }
  }

  fn local_put(&mut self, key: Key, values: Vec<Value>, vctx: Context) {
    let incoming = (
      values.into_iter().sorted().dedup().collect::<Vec<_>>(),
      vctx,
    );
    let merged = match self.store.remove(&key) {
      Some(existing) => {
        merge_values((existing.values, existing.ctx), incoming)
      }
      None => incoming,
    };
    self.store.insert(
      key,
      Stored {
        values: merged.0,
        ctx: merged.1,
      },
    );
  }

  fn snapshot(&self) -> StateSnapshot {
    StateSnapshot {
      store: self
        .store
        .iter()
        .map(|(k, s)| (k.clone(), (s.values.clone(), s.ctx.clone())))
        .collect(),
      alive: self.alive.iter().map(|(p, up)| (*p, *up)).collect(),
    }
  }

  // ---------------------------------------------------------------------
  // client entry & redirects
  // ---------------------------------------------------------------------

  fn client_request(
    &mut self,
    common: &mut Common,
    ctx: &ActorContext<StoreMsg>,
    client: NodeId,
    req: ClientRequest,
  ) {
    if self.is_coordinator(common, req.key()) {
      self.coordinate(common, ctx, client, req);
      return;
    }
    ctx.net.schedule_local_msg(
      common.config.client_timeout,
      ctx.local_interface(),
      ClientTimeout {
        kind: req.kind(),
        nonce: req.nonce(),
      },
    );
    match self.first_alive_coordinator(common, req.key()) {
      None => {
        ctx.net.send(common.id, client, &fail_response(&req));
      }
      Some(coord) => {
        let nonce = req.nonce();
        self.trackers.insert_redirect(
          nonce,
          PendingRedirect {
            client: client,
            request: req.clone(),
          },
        );
        ctx.net.send(
          common.id,
          coord,
          &RedirectedClientRequest {
            client: client,
            request: req,
          },
        );
        ctx.net.schedule_local_msg(
          common.config.redirect_timeout,
          ctx.local_interface(),
          RedirectTimeout {
            nonce: nonce,
            failed_coord: coord,
          },
        );
      }
    }
  }

  fn redirect_timeout(
    &mut self,
    common: &mut Common,
    ctx: &ActorContext<StoreMsg>,
    nonce: Nonce,
    failed: NodeId,
  ) {
    // Entry gone means the coordinator acknowledged; nothing to do.
    if !self.trackers.redirects.contains_key(&nonce) {
      return;
    }
    self.mark_dead(failed);
    let (client, request) = {
      let entry = self.trackers.redirects.get(&nonce).unwrap();
      (entry.client, entry.request.clone())
    };
    match self.first_alive_coordinator(common, request.key()) {
      None => {
        self.trackers.redirects.remove(&nonce);
        ctx.net.send(common.id, client, &fail_response(&request));
      }
      Some(coord) => {
        ctx.net.send(
          common.id,
          coord,
          &RedirectedClientRequest {
            client: client,
            request: request,
          },
        );
        ctx.net.schedule_local_msg(
          common.config.redirect_timeout,
          ctx.local_interface(),
          RedirectTimeout {
            nonce: nonce,
            failed_coord: coord,
          },
        );
      }
    }
  }

  // ---------------------------------------------------------------------
  // coordinator
  // ---------------------------------------------------------------------

  fn coordinate(
    &mut self,
    common: &mut Common,
    ctx: &ActorContext<StoreMsg>,
    client: NodeId,
    req: ClientRequest,
  ) {
    // Membership is fixed, so a redirect can only ever land on a genuine
    // coordinator for the key; anything else is a programmer error.
    assert!(
      self.is_coordinator(common, req.key()),
      "{} is not a coordinator for this key",
      common.id
    );
    // A redirect retried past a lost acknowledgement can deliver the same
    // request twice; duplicates are filtered by nonce lookup.
    let nonce = req.nonce();
    if self.trackers.gets.contains_key(&nonce)
      || self.trackers.puts.contains_key(&nonce)
    {
      return;
    }
    ctx.net.schedule_local_msg(
      common.config.client_timeout,
      ctx.local_interface(),
      ClientTimeout {
        kind: req.kind(),
        nonce: req.nonce(),
      },
    );
    match req {
      ClientRequest::Get { nonce, key } => {
        self.coordinator_get(common, ctx, client, nonce, key);
      }
      ClientRequest::Put {
        nonce,
        key,
        value,
        context,
      } => {
        self.coordinator_put(common, ctx, client, nonce, key, value, context);
      }
    }
  }

  fn coordinator_get(
    &mut self,
    common: &mut Common,
    ctx: &ActorContext<StoreMsg>,
    client: NodeId,
    nonce: Nonce,
    key: Key,
  ) {
    let targets = self.alive_preference(common, &key);
    self.trackers.insert_get(
      nonce,
      PendingGet {
        client: client,
        key: key.clone(),
        responses: HashMap::new(),
        requested: targets.iter().copied().collect(),
      },
    );
    for peer in targets.into_iter().filter(|p| *p != common.id) {
      ctx.net.send(
        common.id,
        peer,
        &CoordinatorGetRequest {
          nonce: nonce,
          key: key.clone(),
        },
      );
      ctx.net.schedule_local_msg(
        common.config.request_timeout,
        ctx.local_interface(),
        CoordinatorRequestTimeout {
          kind: ReqKind::Get,
          nonce: nonce,
          peer: peer,
        },
      );
    }
    // The local read takes the same accounting path as a peer response,
    // minus the wire.
    let (values, read_ctx) = self.local_get(&key);
    self.record_get_response(
      common,
      ctx,
      nonce,
      common.id,
      values,
      read_ctx.without_hint(),
    );
  }

  fn record_get_response(
    &mut self,
    common: &Common,
    ctx: &ActorContext<StoreMsg>,
    nonce: Nonce,
    from: NodeId,
    values: Vec<Value>,
    context: Context,
  ) {
    let quorum = match self.trackers.gets.get_mut(&nonce) {
      Some(pending) if pending.requested.contains(&from) => {
        pending.responses.insert(from, (values, context));
        pending.responses.len() >= common.config.r
      }
      _ => false,
    };
    if quorum {
      let pending = self.trackers.gets.remove(&nonce).unwrap();
      let (values, context) = pending
        .responses
        .into_values()
        .fold((Vec::new(), Context::default()), merge_values);
      ctx.net.send(
        common.id,
        pending.client,
        &ClientGetResponse {
          nonce: nonce,
          success: true,
          values: Some(values),
          context: Some(context),
        },
      );
    }
  }

  fn coordinator_put(
    &mut self,
    common: &mut Common,
    ctx: &ActorContext<StoreMsg>,
    client: NodeId,
    nonce: Nonce,
    key: Key,
    value: Value,
    context: Context,
  ) {
    let mut version = context.version;
    version.tick(common.id);
    let context = Context {
      version: version,
      hint: None,
    };
    // The local apply counts as the first acknowledgement.
    self.local_put(key.clone(), vec![value.clone()], context.clone());
    let (pairs, last) = self.alive_preference_with_hints(common, &key);
    let mut requested = HashMap::new();
    for (peer, hint) in pairs.into_iter().filter(|(p, _)| *p != common.id) {
      ctx.net.send(
        common.id,
        peer,
        &CoordinatorPutRequest {
          nonce: nonce,
          key: key.clone(),
          value: value.clone(),
          context: Context {
            version: context.version.clone(),
            hint: hint,
          },
        },
      );
      ctx.net.schedule_local_msg(
        common.config.request_timeout,
        ctx.local_interface(),
        CoordinatorRequestTimeout {
          kind: ReqKind::Put,
          nonce: nonce,
          peer: peer,
        },
      );
      requested.insert(peer, hint);
    }
    if common.config.w <= 1 {
      ctx.net.send(
        common.id,
        client,
        &ClientPutResponse {
          nonce: nonce,
          success: true,
          value: Some(value),
          context: Some(context),
        },
      );
    } else {
      self.trackers.insert_put(
        nonce,
        PendingPut {
          client: client,
          key: key,
          value: value,
          context: context,
          responses: HashSet::new(),
          requested: requested,
          last_requested_index: last,
        },
      );
    }
  }

  fn record_put_ack(
    &mut self,
    common: &Common,
    ctx: &ActorContext<StoreMsg>,
    nonce: Nonce,
    from: NodeId,
  ) {
    let quorum = match self.trackers.puts.get_mut(&nonce) {
      Some(pending) if pending.requested.contains_key(&from) => {
        pending.responses.insert(from);
        pending.responses.len() + 1 >= common.config.w
      }
      _ => false,
    };
    if quorum {
      let pending = self.trackers.puts.remove(&nonce).unwrap();
      ctx.net.send(
        common.id,
        pending.client,
        &ClientPutResponse {
          nonce: nonce,
          success: true,
          value: Some(pending.value),
          context: Some(pending.context),
        },
      );
    }
  }

  // ---------------------------------------------------------------------
  // timeouts
  // ---------------------------------------------------------------------

  fn client_timeout(
    &mut self,
    common: &Common,
    ctx: &ActorContext<StoreMsg>,
    kind: ReqKind,
    nonce: Nonce,
  ) {
    if let Some(entry) = self.trackers.redirects.remove(&nonce) {
      ctx.net.send(common.id, entry.client, &fail_response(&entry.request));
      return;
    }
    match kind {
      ReqKind::Get => {
        if let Some(pending) = self.trackers.gets.remove(&nonce) {
          ctx.net.send(
            common.id,
            pending.client,
            &ClientGetResponse {
              nonce: nonce,
              success: false,
              values: None,
              context: None,
            },
          );
        }
      }
      ReqKind::Put => {
        if let Some(pending) = self.trackers.puts.remove(&nonce) {
          ctx.net.send(
            common.id,
            pending.client,
            &ClientPutResponse {
              nonce: nonce,
              success: false,
              value: None,
              context: None,
            },
          );
        }
      }
    }
  }

  /// A peer sat on a coordinator request past the deadline: write it off,
  /// and re-issue the same nonce to the next candidate on the walk. When
  /// the walk is exhausted the attempt is abandoned silently; the client
  /// timer delivers the verdict.
  fn request_timeout(
    &mut self,
    common: &mut Common,
    ctx: &ActorContext<StoreMsg>,
    kind: ReqKind,
    nonce: Nonce,
    peer: NodeId,
  ) {
    match kind {
      ReqKind::Get => {
        let pending = matches!(
          self.trackers.gets.get(&nonce),
          Some(p) if !p.responses.contains_key(&peer)
        );
        if !pending {
          return;
        }
        self.mark_dead(peer);
        let (key, next) = {
          let p = self.trackers.gets.get(&nonce).unwrap();
          let next = self
            .ring_walk(common, &p.key)
            .into_iter()
            .find(|c| {
              !p.requested.contains(c) && self.self_or_alive(common, *c)
            });
          (p.key.clone(), next)
        };
        if let Some(candidate) = next {
          self
            .trackers
            .gets
            .get_mut(&nonce)
            .unwrap()
            .requested
            .insert(candidate);
          ctx.net.send(
            common.id,
            candidate,
            &CoordinatorGetRequest {
              nonce: nonce,
              key: key,
            },
          );
          ctx.net.schedule_local_msg(
            common.config.request_timeout,
            ctx.local_interface(),
            CoordinatorRequestTimeout {
              kind: ReqKind::Get,
              nonce: nonce,
              peer: candidate,
            },
          );
        }
      }
      ReqKind::Put => {
        let pending = matches!(
          self.trackers.puts.get(&nonce),
          Some(p) if !p.responses.contains(&peer)
        );
        if !pending {
          return;
        }
        self.mark_dead(peer);
        let (key, version, hint, next) = {
          let p = self.trackers.puts.get(&nonce).unwrap();
          // A natural owner that timed out becomes the hint for its
          // substitute; a substitute's hint is forwarded unchanged.
          let hint = match p.requested.get(&peer) {
            Some(Some(h)) => Some(*h),
            _ => Some(peer),
          };
          let next = self
            .ring_walk(common, &p.key)
            .into_iter()
            .enumerate()
            .find(|(i, c)| {
              *i > p.last_requested_index
                && !p.requested.contains_key(c)
                && self.self_or_alive(common, *c)
            });
          (p.key.clone(), p.context.version.clone(), hint, next)
        };
        if let Some((index, candidate)) = next {
          let p = self.trackers.puts.get_mut(&nonce).unwrap();
          p.requested.insert(candidate, hint);
          p.last_requested_index = index;
          let value = p.value.clone();
          ctx.net.send(
            common.id,
            candidate,
            &CoordinatorPutRequest {
              nonce: nonce,
              key: key,
              value: value,
              context: Context {
                version: version,
                hint: hint,
              },
            },
          );
          ctx.net.schedule_local_msg(
            common.config.request_timeout,
            ctx.local_interface(),
            CoordinatorRequestTimeout {
              kind: ReqKind::Put,
              nonce: nonce,
              peer: candidate,
            },
          );
        }
      }
    }
  }

  // ---------------------------------------------------------------------
  // hinted handoff
  // ---------------------------------------------------------------------

  /// Batches every stored entry hinted at `target` into one handoff
  /// request, skipping keys already in flight whose stored context has not
  /// advanced past what was sent.
  fn attempt_handoff(
    &mut self,
    common: &mut Common,
    ctx: &ActorContext<StoreMsg>,
    target: NodeId,
  ) {
    let inflight = self.trackers.handoffs.get(&target);
    let mut data = Vec::new();
    let mut sent = BTreeMap::new();
    for (key, stored) in self.store.iter() {
      if stored.ctx.hint != Some(target) {
        continue;
      }
      let already_inflight = inflight.map_or(false, |by_nonce| {
        by_nonce.values().any(|keys| {
          keys.get(key).map_or(false, |sent_ctx| {
            stored.ctx.version.compare(&sent_ctx.version) != ClockOrd::After
          })
        })
      });
      if already_inflight {
        continue;
      }
      data.push((key.clone(), stored.values.clone(), stored.ctx.without_hint()));
      sent.insert(key.clone(), stored.ctx.without_hint());
    }
    if data.is_empty() {
      return;
    }
    let nonce = common.gen_nonce();
    debug!(
      LOG_LEVEL,
      ctx,
      format!("handing {} keys off to {}", data.len(), target)
    );
    self
      .trackers
      .handoffs
      .entry(target)
      .or_default()
      .insert(nonce, sent);
    ctx.net.send(
      common.id,
      target,
      &HandoffRequest {
        nonce: nonce,
        data: data,
      },
    );
    ctx.net.schedule_local_msg(
      common.config.request_timeout,
      ctx.local_interface(),
      HandoffTimeout {
        nonce: nonce,
        peer: target,
      },
    );
  }

  /// The target applied the batch: drop the hints, but only where the
  /// stored context has not advanced past what was shipped.
  fn complete_handoff(&mut self, peer: NodeId, nonce: Nonce) {
    let sent = match self
      .trackers
      .handoffs
      .get_mut(&peer)
      .and_then(|m| m.remove(&nonce))
    {
      Some(sent) => sent,
      None => return,
    };
    for (key, sent_ctx) in sent {
      if let Some(stored) = self.store.get_mut(&key) {
        if stored.ctx.hint == Some(peer)
          && stored.ctx.version.compare(&sent_ctx.version) != ClockOrd::After
        {
          stored.ctx.hint = None;
        }
      }
    }
    if self
      .trackers
      .handoffs
      .get(&peer)
      .map_or(false, |m| m.is_empty())
    {
      self.trackers.handoffs.remove(&peer);
    }
  }

  fn handoff_timeout(&mut self, nonce: Nonce, peer: NodeId) {
    let dropped = self
      .trackers
      .handoffs
      .get_mut(&peer)
      .map_or(false, |m| m.remove(&nonce).is_some());
    if dropped {
      // Assume the target died again; the stored hints stay put so the
      // next liveness transition retries.
      self.mark_dead(peer);
      if self
        .trackers
        .handoffs
        .get(&peer)
        .map_or(false, |m| m.is_empty())
      {
        self.trackers.handoffs.remove(&peer);
      }
    }
  }

  // ---------------------------------------------------------------------
  // liveness probing & anti-entropy
  // ---------------------------------------------------------------------

  fn health_check(
    &mut self,
    common: &Common,
    ctx: &ActorContext<StoreMsg>,
    epoch: u64,
  ) {
    if epoch != common.epoch {
      return;
    }
    let dead = self
      .alive
      .iter()
      .filter(|(_, up)| !**up)
      .map(|(p, _)| *p)
      .collect::<Vec<_>>();
    for peer in dead {
      ctx.net.send(common.id, peer, &AliveCheckRequest);
    }
    ctx.net.schedule_local_msg(
      common.config.health_check_interval,
      ctx.local_interface(),
      HealthCheckTimeout { epoch: epoch },
    );
  }

  /// Periodic anti-entropy round: snapshot the keyspace shared with one
  /// random live peer and offer it the tree. The receiver pushes back
  /// whatever the divergence index says is missing here.
  fn merkle_sync(
    &mut self,
    common: &mut Common,
    ctx: &ActorContext<StoreMsg>,
    epoch: u64,
  ) {
    if epoch != common.epoch {
      return;
    }
    let peer = self
      .alive
      .iter()
      .filter(|(_, up)| **up)
      .map(|(p, _)| *p)
      .choose(&mut rand::thread_rng());
    if let Some(peer) = peer {
      let (tree, _) = self.build_snapshot(common, peer);
      let nonce = common.gen_nonce();
      ctx.net.send(
        common.id,
        peer,
        &SyncRequest {
          nonce: nonce,
          tree: tree,
        },
      );
    }
    ctx.net.schedule_local_msg(
      common.config.merkle_sync_interval,
      ctx.local_interface(),
      MerkleSyncTimeout { epoch: epoch },
    );
  }

  fn answer_sync(
    &mut self,
    common: &Common,
    ctx: &ActorContext<StoreMsg>,
    from: NodeId,
    nonce: Nonce,
    theirs: MerkleTree,
  ) {
    let (mine, keys) = self.build_snapshot(common, from);
    if let TreeCmp::SendFrom(start) = compare_trees(&theirs, &mine) {
      let entries = keys
        .into_iter()
        .skip(start)
        .map(|key| {
          let stored = &self.store[&key];
          (key, stored.values.clone(), stored.ctx.without_hint())
        })
        .collect::<Vec<_>>();
      if !entries.is_empty() {
        ctx.net.send(
          common.id,
          from,
          &SyncPush {
            nonce: nonce,
            entries: entries,
          },
        );
      }
    }
  }

  /// Ephemeral snapshot over the keys both `self` and `peer` own, in
  /// ascending key order so both sides agree on leaf indices.
  fn build_snapshot(
    &self,
    common: &Common,
    peer: NodeId,
  ) -> (MerkleTree, Vec<Key>) {
    let mut tree = MerkleTree::new();
    let mut keys = Vec::new();
    for (key, stored) in self.store.iter() {
      let pref = self.preference(common, key);
      if pref.contains(&common.id) && pref.contains(&peer) {
        tree.insert(&leaf_digest(key, &stored.values, &stored.ctx.version));
        keys.push(key.clone());
      }
    }
    (tree, keys)
  }
}

fn fail_response(req: &ClientRequest) -> StoreMsg {
  match req {
    ClientRequest::Get { nonce, .. } => ClientGetResponse {
      nonce: *nonce,
      success: false,
      values: None,
      context: None,
    },
    ClientRequest::Put { nonce, .. } => ClientPutResponse {
      nonce: *nonce,
      success: false,
      value: None,
      context: None,
    },
  }
}

#[cfg(test)]
use crate::store::VectorClock;

#[cfg(test)]
fn test_cluster(
  n: usize,
) -> (Vec<NodeId>, NodeRing, StoreConfig) {
  let ids = (1..=5).map(NodeId).collect::<Vec<_>>();
  let config = StoreConfig {
    n: n,
    ..StoreConfig::default()
  };
  let ring = NodeRing::new(&ids, config.vnodes);
  (ids, ring, config)
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

#[cfg(test)]
fn ctx_of(entries: &[(u64, u64)]) -> Context {
  Context {
    version: vc(entries),
    hint: None,
  }
}

#[test]
fn test_merge_values_rules() {
  let old = (vec![b"a".to_vec()], ctx_of(&[(1, 1)]));
  let new = (vec![b"b".to_vec()], ctx_of(&[(1, 2)]));
  assert_eq!(new.clone(), merge_values(old.clone(), new.clone()));
  assert_eq!(new.clone(), merge_values(new.clone(), old.clone()));

  let left = (vec![b"x".to_vec(), b"y".to_vec()], ctx_of(&[(1, 1)]));
  let right = (vec![b"y".to_vec(), b"z".to_vec()], ctx_of(&[(2, 1)]));
  let merged = merge_values(left, right);
  assert_eq!(
    vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()],
    merged.0
  );
  assert_eq!(vc(&[(1, 1), (2, 1)]), merged.1.version);
}

#[test]
fn test_local_put_reconciles_siblings() {
  let mut state = NodeState::fresh(&[NodeId(2), NodeId(3)]);
  state.local_put(b"k".to_vec(), vec![b"a".to_vec()], ctx_of(&[(1, 1)]));
  state.local_put(b"k".to_vec(), vec![b"b".to_vec()], ctx_of(&[(2, 1)]));
  assert_eq!(
    vec![b"a".to_vec(), b"b".to_vec()],
    state.store[&b"k".to_vec()].values
  );
  // A strictly later write collapses the siblings.
  state.local_put(b"k".to_vec(), vec![b"c".to_vec()], ctx_of(&[(1, 2), (2, 1)]));
  assert_eq!(vec![b"c".to_vec()], state.store[&b"k".to_vec()].values);
}

#[test]
fn test_alive_preference_substitution() {
  let (ids, ring, config) = test_cluster(3);
  let key = b"some key".to_vec();
  let walk = ring.pref(&key, ids.len());
  let mut replica =
    Replica::new(walk[0], BTreeMap::new(), &ids, config).unwrap();
  let state = match &mut replica.phase {
    Phase::Up(state) => state,
    Phase::Crashed => unreachable!(),
  };
  assert_eq!(
    walk[..3].to_vec(),
    state.alive_preference(&replica.common, &key)
  );

  state.mark_dead(walk[1]);
  let (pairs, last) = state.alive_preference_with_hints(&replica.common, &key);
  assert_eq!(
    vec![
      (walk[0], None),
      (walk[2], None),
      (walk[3], Some(walk[1])),
    ],
    pairs
  );
  assert_eq!(3, last);
  assert_eq!(
    Some(walk[0]),
    state.first_alive_coordinator(&replica.common, &key)
  );

  state.mark_dead(walk[0]);
  // Self stays eligible even when the map says otherwise; it is not in
  // the map at all.
  assert_eq!(
    Some(walk[0]),
    state.first_alive_coordinator(&replica.common, &key)
  );
}

#[test]
fn test_init_filters_seed_to_owned_keys() {
  let (ids, ring, config) = test_cluster(2);
  let seed = (0..40u32)
    .map(|i| (format!("key-{}", i).into_bytes(), b"v".to_vec()))
    .collect::<BTreeMap<_, _>>();
  let id = ids[2];
  let replica = Replica::new(id, seed.clone(), &ids, config.clone()).unwrap();
  let state = match &replica.phase {
    Phase::Up(state) => state,
    Phase::Crashed => unreachable!(),
  };
  for key in seed.keys() {
    let owned = ring.pref(key, config.n).contains(&id);
    assert_eq!(owned, state.store.contains_key(key), "key {:?}", key);
  }
}

#[test]
fn test_handoff_batch_excludes_inflight() {
  let (ids, _, config) = test_cluster(3);
  let mut replica =
    Replica::new(ids[0], BTreeMap::new(), &ids, config).unwrap();
  let target = ids[1];
  let state = match &mut replica.phase {
    Phase::Up(state) => state,
    Phase::Crashed => unreachable!(),
  };
  let hinted = Context {
    version: vc(&[(1, 1)]),
    hint: Some(target),
  };
  state.local_put(b"k1".to_vec(), vec![b"a".to_vec()], hinted.clone());
  // Pretend k1 is already in flight with the same version.
  let mut sent = BTreeMap::new();
  sent.insert(b"k1".to_vec(), hinted.without_hint());
  state
    .trackers
    .handoffs
    .entry(target)
    .or_default()
    .insert(77, sent);

  let inflight = state.trackers.handoffs.get(&target).unwrap();
  let blocked = inflight.values().any(|keys| {
    keys
      .get(&b"k1".to_vec())
      .map_or(false, |sent_ctx| {
        state.store[&b"k1".to_vec()]
          .ctx
          .version
          .compare(&sent_ctx.version)
          != ClockOrd::After
      })
  });
  assert!(blocked);

  // Once the stored context advances, the exclusion lifts.
  state.local_put(
    b"k1".to_vec(),
    vec![b"b".to_vec()],
    Context {
      version: vc(&[(1, 2)]),
      hint: Some(target),
    },
  );
  let inflight = state.trackers.handoffs.get(&target).unwrap();
  let blocked = inflight.values().any(|keys| {
    keys
      .get(&b"k1".to_vec())
      .map_or(false, |sent_ctx| {
        state.store[&b"k1".to_vec()]
          .ctx
          .version
          .compare(&sent_ctx.version)
          != ClockOrd::After
      })
  });
  assert!(!blocked);
}

#[test]
fn test_complete_handoff_clears_hints() {
  let (ids, _, config) = test_cluster(3);
  let mut replica =
    Replica::new(ids[0], BTreeMap::new(), &ids, config).unwrap();
  let target = ids[1];
  let state = match &mut replica.phase {
    Phase::Up(state) => state,
    Phase::Crashed => unreachable!(),
  };
  state.local_put(
    b"k1".to_vec(),
    vec![b"a".to_vec()],
    Context {
      version: vc(&[(1, 1)]),
      hint: Some(target),
    },
  );
  state.local_put(
    b"k2".to_vec(),
    vec![b"b".to_vec()],
    Context {
      version: vc(&[(1, 1)]),
      hint: Some(target),
    },
  );
  let mut sent = BTreeMap::new();
  sent.insert(b"k1".to_vec(), ctx_of(&[(1, 1)]));
  sent.insert(b"k2".to_vec(), ctx_of(&[(1, 1)]));
  state
    .trackers
    .handoffs
    .entry(target)
    .or_default()
    .insert(42, sent);
  // k2 advanced after the batch went out; its hint must survive.
  state.local_put(
    b"k2".to_vec(),
    vec![b"b2".to_vec()],
    Context {
      version: vc(&[(1, 2)]),
      hint: Some(target),
    },
  );

  state.complete_handoff(target, 42);
  assert_eq!(None, state.store[&b"k1".to_vec()].ctx.hint);
  assert_eq!(Some(target), state.store[&b"k2".to_vec()].ctx.hint);
  assert!(state.trackers.handoffs.is_empty());
}

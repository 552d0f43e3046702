use crate::core::{LogLevel, Net};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;

/// Identity of a principal on the bus: a cluster node or the test/client.
/// Equality and total order are both required, the latter for deterministic
/// tie-breaks and ring lookup.
#[derive(
  Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);
impl fmt::Debug for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "n{}", self.0)
  }
}
impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "n{}", self.0)
  }
}

/// Every inbox item carries the sender's identity.
#[derive(Clone, Debug)]
pub struct Envelope<M> {
  pub from: NodeId,
  pub msg: M,
}

/// A single-threaded cooperative actor. All state transitions happen in
/// `recv`, one message or timer at a time; nothing inside a handler blocks.
#[async_trait]
pub trait Actor<M: Send + 'static> {
  async fn pre_start(&mut self, _ctx: &ActorContext<M>) {}
  async fn recv(&mut self, ctx: &ActorContext<M>, env: Envelope<M>);
}

/// Handle for enqueueing directly into an actor's inbox, bypassing the bus.
/// Used for timer self-sends.
pub struct LocalRef<M> {
  pub(crate) owner: NodeId,
  pub(crate) tx: UnboundedSender<Envelope<M>>,
}
impl<M> Clone for LocalRef<M> {
  fn clone(&self) -> Self {
    LocalRef {
      owner: self.owner,
      tx: self.tx.clone(),
    }
  }
}
impl<M: Send + 'static> LocalRef<M> {
  pub fn send(&self, msg: M) -> bool {
    self
      .tx
      .send(Envelope {
        from: self.owner,
        msg: msg,
      })
      .is_ok()
  }
}

pub struct ActorContext<M: Send + 'static> {
  pub id: NodeId,
  pub net: Net<M>,
  pub(crate) tx: UnboundedSender<Envelope<M>>,
}
impl<M: Send + 'static> ActorContext<M> {
  pub fn local_interface(&self) -> LocalRef<M> {
    LocalRef {
      owner: self.id,
      tx: self.tx.clone(),
    }
  }

  pub fn log<S: ToString>(&self, level: LogLevel, msg: S) {
    self.net.log(level, self.id, msg.to_string());
  }
}

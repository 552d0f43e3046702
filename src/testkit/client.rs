use crate::core::{Envelope, Net, NodeId};
use crate::store::{Context, Nonce, StateSnapshot, StoreMsg, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientError {
  /// Nothing answered before the client-side deadline; the target node
  /// may be crashed.
  #[error("no response before the deadline")]
  Timeout,
  /// The cluster answered, but with `success = false`.
  #[error("request failed")]
  Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetOk {
  /// All current siblings for the key; empty if nothing is stored.
  pub values: Vec<Value>,
  /// Merged context to echo back on the next put.
  pub context: Context,
}

/// The test/client principal: registers an inbox on the bus, fires client
/// requests at chosen nodes, and matches responses by nonce. Duplicate and
/// late responses are discarded, first answer wins.
pub struct KvClient {
  id: NodeId,
  net: Net<StoreMsg>,
  rx: UnboundedReceiver<Envelope<StoreMsg>>,
  deadline: Duration,
  counter: u64,
}
impl KvClient {
  pub fn new(net: &Net<StoreMsg>, id: NodeId, deadline: Duration) -> KvClient {
    KvClient {
      id: id,
      net: net.clone(),
      rx: net.channel(id),
      deadline: deadline,
      counter: 0,
    }
  }

  pub async fn get(
    &mut self,
    node: NodeId,
    key: &[u8],
  ) -> Result<GetOk, ClientError> {
    let nonce = self.gen_nonce();
    self.net.send(
      self.id,
      node,
      &StoreMsg::ClientGetRequest {
        nonce: nonce,
        key: key.to_vec(),
      },
    );
    match self.await_response(nonce).await? {
      StoreMsg::ClientGetResponse {
        success: true,
        values,
        context,
        ..
      } => Ok(GetOk {
        values: values.unwrap_or_default(),
        context: context.unwrap_or_default(),
      }),
      _ => Err(ClientError::Unavailable),
    }
  }

  pub async fn put(
    &mut self,
    node: NodeId,
    key: &[u8],
    value: &[u8],
    context: Context,
  ) -> Result<Context, ClientError> {
    let nonce = self.gen_nonce();
    self.net.send(
      self.id,
      node,
      &StoreMsg::ClientPutRequest {
        nonce: nonce,
        key: key.to_vec(),
        value: value.to_vec(),
        context: context,
      },
    );
    match self.await_response(nonce).await? {
      StoreMsg::ClientPutResponse {
        success: true,
        context,
        ..
      } => Ok(context.unwrap_or_default()),
      _ => Err(ClientError::Unavailable),
    }
  }

  /// Full state snapshot of one node. Tests only; a crashed node never
  /// answers.
  pub async fn state(
    &mut self,
    node: NodeId,
  ) -> Result<StateSnapshot, ClientError> {
    let nonce = self.gen_nonce();
    self
      .net
      .send(self.id, node, &StoreMsg::GetStateRequest { nonce: nonce });
    match self.await_response(nonce).await? {
      StoreMsg::GetStateResponse { state, .. } => Ok(state),
      _ => Err(ClientError::Unavailable),
    }
  }

  pub fn crash(&self, node: NodeId) {
    self.net.send(self.id, node, &StoreMsg::Crash);
  }

  pub fn recover(&self, node: NodeId) {
    self.net.send(self.id, node, &StoreMsg::Recover);
  }

  fn gen_nonce(&mut self) -> Nonce {
    self.counter += 1;
    (self.id.0 << 32) | (self.counter & 0xffff_ffff)
  }

  async fn await_response(
    &mut self,
    nonce: Nonce,
  ) -> Result<StoreMsg, ClientError> {
    let deadline = Instant::now() + self.deadline;
    loop {
      let env = tokio::time::timeout_at(deadline, self.rx.recv())
        .await
        .map_err(|_| ClientError::Timeout)?
        .ok_or(ClientError::Timeout)?;
      match &env.msg {
        StoreMsg::ClientGetResponse { nonce: n, .. }
        | StoreMsg::ClientPutResponse { nonce: n, .. }
        | StoreMsg::GetStateResponse { nonce: n, .. }
          if *n == nonce =>
        {
          return Ok(env.msg);
        }
        // Response to an older request, or a duplicate: drop it.
        _ => {}
      }
    }
  }
}

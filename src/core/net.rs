use crate::core::{
  Actor, ActorContext, Envelope, LocalRef, LogLevel, Logger, LoggerMsg, NodeId,
};
use crate::testkit::FailureConfigMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// The message bus. An in-process registry of inboxes standing in for the
/// network: `send` serializes the message, consults the failure map for the
/// destination, and either drops it, delivers it, or delivers it after a
/// random delay. Per-sender FIFO is not guaranteed once delays are in play,
/// and sends to unregistered ids vanish, like UDP.
pub struct Net<M: Send + 'static> {
  inner: Arc<NetInner<M>>,
}
impl<M: Send + 'static> Clone for Net<M> {
  fn clone(&self) -> Self {
    Net {
      inner: self.inner.clone(),
    }
  }
}

struct NetInner<M: Send + 'static> {
  inboxes: Mutex<HashMap<NodeId, UnboundedSender<Envelope<M>>>>,
  fail: RwLock<FailureConfigMap>,
  logger: UnboundedSender<LoggerMsg>,
}

impl<M: Send + 'static> Net<M> {
  pub fn log(&self, level: LogLevel, id: NodeId, msg: String) {
    let _ = self.inner.logger.send(LoggerMsg::Log(level, id, msg));
  }
}

impl<M> Net<M>
where
  M: Serialize + DeserializeOwned + Send + 'static,
{
  /// Requires a running tokio runtime; the logger task starts immediately.
  pub fn new(level: LogLevel) -> Net<M> {
    Net {
      inner: Arc::new(NetInner {
        inboxes: Mutex::new(HashMap::new()),
        fail: RwLock::new(FailureConfigMap::default()),
        logger: Logger::spawn(level),
      }),
    }
  }

  pub fn set_failure(&self, map: FailureConfigMap) {
    *self.inner.fail.write().unwrap() = map;
  }

  /// Registers `id` on the bus and runs the actor's inbox loop.
  pub fn spawn<A>(&self, id: NodeId, mut actor: A) -> LocalRef<M>
  where
    A: Actor<M> + Send + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope<M>>();
    self.inner.inboxes.lock().unwrap().insert(id, tx.clone());
    let ctx = ActorContext {
      id: id,
      net: self.clone(),
      tx: tx.clone(),
    };
    tokio::spawn(async move {
      actor.pre_start(&ctx).await;
      while let Some(env) = rx.recv().await {
        actor.recv(&ctx, env).await;
      }
    });
    LocalRef {
      owner: id,
      tx: tx,
    }
  }

  /// Registers a raw inbox for a principal that is not an actor, such as
  /// the test/client driver.
  pub fn channel(&self, id: NodeId) -> UnboundedReceiver<Envelope<M>> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.inner.inboxes.lock().unwrap().insert(id, tx);
    rx
  }

  /// Best-effort, non-blocking send. The message round-trips through its
  /// wire encoding so only serializable state ever crosses nodes.
  pub fn send(&self, from: NodeId, to: NodeId, msg: &M) {
    let bytes = serde_cbor::to_vec(msg).expect("unserializable message");
    let cfg = *self.inner.fail.read().unwrap().get(&to);
    if rand::random::<f64>() < cfg.drop_prob {
      return;
    }
    let tx = match self.inner.inboxes.lock().unwrap().get(&to) {
      Some(tx) => tx.clone(),
      None => return,
    };
    match cfg.delay {
      None => {
        let msg = serde_cbor::from_slice(&bytes).expect("undecodable message");
        let _ = tx.send(Envelope {
          from: from,
          msg: msg,
        });
      }
      Some((min, max)) => {
        let wait = min + (max - min).mul_f64(rand::random::<f64>());
        tokio::spawn(async move {
          tokio::time::sleep(wait).await;
          let msg =
            serde_cbor::from_slice(&bytes).expect("undecodable message");
          let _ = tx.send(Envelope {
            from: from,
            msg: msg,
          });
        });
      }
    }
  }

  /// One-shot timer: enqueues `msg` to `dest` after `dur`. Timers bypass
  /// the failure map; a node's clock does not drop ticks.
  pub fn schedule_local_msg(
    &self,
    dur: Duration,
    dest: LocalRef<M>,
    msg: M,
  ) -> JoinHandle<bool> {
    tokio::spawn(async move {
      tokio::time::sleep(dur).await;
      dest.send(msg)
    })
  }
}

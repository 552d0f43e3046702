use crate::core::{LogLevel, Net, NodeId};
use crate::store::{Context, Key, Replica, StoreConfig, StoreMsg, Value};
use crate::testkit::{FailureConfigMap, KvClient};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};

/// Shape of a harness run: cluster size, keyspace, operation mix, and the
/// fault model applied to the bus.
#[derive(Clone)]
pub struct WorkloadParams {
  pub nodes: usize,
  pub keys: usize,
  pub ops: usize,
  /// Probability that an operation is a put rather than a get.
  pub put_ratio: f64,
  pub config: StoreConfig,
  pub fail: FailureConfigMap,
  pub log_level: LogLevel,
}
impl Default for WorkloadParams {
  fn default() -> Self {
    WorkloadParams {
      nodes: 5,
      keys: 16,
      ops: 200,
      put_ratio: 0.3,
      config: StoreConfig::default(),
      fail: FailureConfigMap::from_env(),
      log_level: LogLevel::Off,
    }
  }
}

/// The measurable properties of a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Measurements {
  /// Requests answered with `success = true` before the client deadline,
  /// over requests issued.
  pub availability: f64,
  /// Successful gets that returned more than one sibling, over successful
  /// gets.
  pub inconsistency: f64,
  /// Successful gets whose sibling set missed the most recently
  /// acknowledged write for the key, over successful gets.
  pub stale_reads: f64,
}

/// Spins up a cluster, seeds every key, and drives a random single-client
/// workload against random nodes, echoing contexts the way a well-behaved
/// client would. Returns the observed measurements.
pub async fn measure(params: WorkloadParams) -> Measurements {
  let net: Net<StoreMsg> = Net::new(params.log_level);
  net.set_failure(params.fail.clone());
  let ids = (1..=params.nodes as u64).map(NodeId).collect::<Vec<_>>();
  let seed = (0..params.keys)
    .map(|i| (key_name(i), b"seed".to_vec()))
    .collect::<BTreeMap<Key, Value>>();
  for id in ids.iter() {
    let replica = Replica::new(*id, seed.clone(), &ids, params.config.clone())
      .expect("invalid workload config");
    net.spawn(*id, replica);
  }
  let mut client = KvClient::new(
    &net,
    NodeId(u32::MAX as u64),
    params.config.client_timeout * 2,
  );

  let mut contexts: HashMap<Key, Context> = HashMap::new();
  let mut latest: HashMap<Key, Value> =
    seed.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
  let mut issued = 0usize;
  let mut answered = 0usize;
  let mut gets_ok = 0usize;
  let mut sibling_reads = 0usize;
  let mut stale = 0usize;

  for op in 0..params.ops {
    let key = key_name(rand::thread_rng().gen_range(0..params.keys));
    let node = *ids.choose(&mut rand::thread_rng()).unwrap();
    issued += 1;
    if rand::thread_rng().gen_bool(params.put_ratio) {
      let value = format!("v{}", op).into_bytes();
      let context = contexts.get(&key).cloned().unwrap_or_default();
      if let Ok(new_ctx) = client.put(node, &key, &value, context).await {
        answered += 1;
        contexts.insert(key.clone(), new_ctx);
        latest.insert(key, value);
      }
    } else if let Ok(got) = client.get(node, &key).await {
      answered += 1;
      gets_ok += 1;
      if got.values.len() > 1 {
        sibling_reads += 1;
      }
      if let Some(expect) = latest.get(&key) {
        if !got.values.iter().any(|v| v == expect) {
          stale += 1;
        }
      }
      contexts.insert(key, got.context);
    }
  }

  Measurements {
    availability: answered as f64 / issued.max(1) as f64,
    inconsistency: sibling_reads as f64 / gets_ok.max(1) as f64,
    stale_reads: stale as f64 / gets_ok.max(1) as f64,
  }
}

fn key_name(i: usize) -> Key {
  format!("key-{:04}", i).into_bytes()
}

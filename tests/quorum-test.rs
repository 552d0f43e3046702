use maplit::btreemap;
use replikv::core::{LogLevel, Net, NodeId};
use replikv::store::{Context, NodeRing, Replica, StoreConfig, StoreMsg};
use replikv::testkit::{ClientError, KvClient};
use std::collections::BTreeMap;
use std::time::Duration;

fn ms(x: u64) -> Duration {
  Duration::from_millis(x)
}

fn quick_config() -> StoreConfig {
  StoreConfig {
    client_timeout: ms(600),
    redirect_timeout: ms(80),
    request_timeout: ms(80),
    health_check_interval: ms(150),
    merkle_sync_interval: ms(150),
    ..StoreConfig::default()
  }
}

fn spawn_cluster(
  net: &Net<StoreMsg>,
  ids: &[NodeId],
  seed: &BTreeMap<Vec<u8>, Vec<u8>>,
  config: &StoreConfig,
) {
  for id in ids {
    let replica =
      Replica::new(*id, seed.clone(), ids, config.clone()).unwrap();
    net.spawn(*id, replica);
  }
}

#[tokio::test]
async fn get_of_seeded_key() {
  let ids = [NodeId(1), NodeId(2), NodeId(3)];
  let config = quick_config();
  let net = Net::new(LogLevel::Off);
  let seed = btreemap! { b"foo".to_vec() => b"42".to_vec() };
  spawn_cluster(&net, &ids, &seed, &config);

  let mut client = KvClient::new(&net, NodeId(100), ms(2000));
  let got = client.get(NodeId(1), b"foo").await.unwrap();
  assert_eq!(vec![b"42".to_vec()], got.values);
}

#[tokio::test]
async fn get_of_missing_key_succeeds_empty() {
  let ids = [NodeId(1), NodeId(2), NodeId(3)];
  let config = quick_config();
  let net = Net::new(LogLevel::Off);
  spawn_cluster(&net, &ids, &BTreeMap::new(), &config);

  let mut client = KvClient::new(&net, NodeId(100), ms(2000));
  let got = client.get(NodeId(2), b"nothing here").await.unwrap();
  assert!(got.values.is_empty());
}

#[tokio::test]
async fn get_at_non_coordinator_redirects() {
  let ids = (1..=4).map(NodeId).collect::<Vec<_>>();
  let config = StoreConfig {
    n: 1,
    r: 1,
    w: 1,
    ..quick_config()
  };
  let net = Net::new(LogLevel::Off);
  let seed = btreemap! { b"foo".to_vec() => b"42".to_vec() };
  spawn_cluster(&net, &ids, &seed, &config);

  let ring = NodeRing::new(&ids, config.vnodes);
  let coordinator = ring.pref(b"foo", 1)[0];
  let edge = *ids.iter().find(|id| **id != coordinator).unwrap();

  let mut client = KvClient::new(&net, NodeId(100), ms(2000));
  let got = client.get(edge, b"foo").await.unwrap();
  assert_eq!(vec![b"42".to_vec()], got.values);
}

#[tokio::test]
async fn put_descends_previous_value() {
  let ids = [NodeId(1), NodeId(2), NodeId(3)];
  let config = quick_config();
  let net = Net::new(LogLevel::Off);
  let seed = btreemap! { b"foo".to_vec() => b"42".to_vec() };
  spawn_cluster(&net, &ids, &seed, &config);

  let mut client = KvClient::new(&net, NodeId(100), ms(2000));
  let got = client.get(NodeId(1), b"foo").await.unwrap();
  let new_ctx = client
    .put(NodeId(1), b"foo", b"49", got.context)
    .await
    .unwrap();
  assert!(!new_ctx.version.is_empty());

  let got = client.get(NodeId(1), b"foo").await.unwrap();
  assert_eq!(vec![b"49".to_vec()], got.values);
}

#[tokio::test]
async fn independent_puts_become_siblings() {
  let ids = [NodeId(1)];
  let config = StoreConfig {
    n: 1,
    r: 1,
    w: 1,
    ..quick_config()
  };
  let net = Net::new(LogLevel::Off);
  spawn_cluster(&net, &ids, &BTreeMap::new(), &config);

  let mut client = KvClient::new(&net, NodeId(100), ms(2000));
  // Two writes with no causal relation: both tick only the coordinator's
  // component from an empty clock, so their versions are equal, and
  // equal clocks compare concurrent.
  client
    .put(NodeId(1), b"foo", b"left", Context::default())
    .await
    .unwrap();
  client
    .put(NodeId(1), b"foo", b"right", Context::default())
    .await
    .unwrap();

  let got = client.get(NodeId(1), b"foo").await.unwrap();
  assert_eq!(vec![b"left".to_vec(), b"right".to_vec()], got.values);

  // Writing with the merged context collapses the siblings.
  client
    .put(NodeId(1), b"foo", b"final", got.context)
    .await
    .unwrap();
  let got = client.get(NodeId(1), b"foo").await.unwrap();
  assert_eq!(vec![b"final".to_vec()], got.values);
}

#[tokio::test]
async fn requests_fail_without_quorum() {
  let ids = [NodeId(1), NodeId(2), NodeId(3)];
  let config = StoreConfig {
    n: 3,
    r: 2,
    w: 3,
    ..quick_config()
  };
  let net = Net::new(LogLevel::Off);
  spawn_cluster(&net, &ids, &BTreeMap::new(), &config);

  let mut client = KvClient::new(&net, NodeId(100), ms(2000));
  client.crash(NodeId(2));
  client.crash(NodeId(3));
  tokio::time::sleep(ms(50)).await;

  // W = 3 needs two peer acknowledgements that can never arrive; the
  // client timer delivers the failure.
  let err = client
    .put(NodeId(1), b"foo", b"v", Context::default())
    .await
    .unwrap_err();
  assert_eq!(ClientError::Unavailable, err);

  // Both peers are marked dead by now, so R = 2 is unreachable too.
  let err = client.get(NodeId(1), b"foo").await.unwrap_err();
  assert_eq!(ClientError::Unavailable, err);
}

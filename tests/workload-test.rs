use replikv::core::LogLevel;
use replikv::store::StoreConfig;
use replikv::testkit::{measure, FailureConfigMap, WorkloadParams};
use std::time::Duration;

#[tokio::test]
async fn faultless_run_is_fully_available_and_consistent() {
  let params = WorkloadParams {
    nodes: 4,
    keys: 8,
    ops: 80,
    put_ratio: 0.4,
    config: StoreConfig {
      client_timeout: Duration::from_millis(600),
      redirect_timeout: Duration::from_millis(80),
      request_timeout: Duration::from_millis(80),
      health_check_interval: Duration::from_millis(150),
      merkle_sync_interval: Duration::from_millis(150),
      ..StoreConfig::default()
    },
    fail: FailureConfigMap::default(),
    log_level: LogLevel::Off,
  };
  let measurements = measure(params).await;
  assert_eq!(1.0, measurements.availability);
  assert_eq!(0.0, measurements.inconsistency);
  assert_eq!(0.0, measurements.stale_reads);
}

#[tokio::test]
async fn lossy_bus_still_mostly_available() {
  let mut fail = FailureConfigMap::default();
  fail.cluster_wide.drop_prob = 0.05;
  fail.cluster_wide.delay =
    Some((Duration::from_millis(1), Duration::from_millis(5)));
  let params = WorkloadParams {
    nodes: 5,
    keys: 8,
    ops: 40,
    put_ratio: 0.3,
    config: StoreConfig {
      client_timeout: Duration::from_millis(600),
      redirect_timeout: Duration::from_millis(80),
      request_timeout: Duration::from_millis(80),
      health_check_interval: Duration::from_millis(150),
      merkle_sync_interval: Duration::from_millis(150),
      ..StoreConfig::default()
    },
    fail: fail,
    log_level: LogLevel::Off,
  };
  let measurements = measure(params).await;
  // Retries and redirects paper over a mildly lossy bus; this bound is
  // deliberately loose because the run is randomized.
  assert!(measurements.availability >= 0.5);
}

use std::time::Duration;
use thiserror::Error;

/// Per-node tunables: quorum parameters, ring vnodes, and the five timer
/// durations the state machine runs on.
#[derive(Clone, Debug)]
pub struct StoreConfig {
  /// Replication factor.
  pub n: usize,
  /// Read quorum, counting the coordinator's own local read.
  pub r: usize,
  /// Write quorum, counting the coordinator's local apply as one.
  pub w: usize,
  pub vnodes: u32,
  pub client_timeout: Duration,
  pub redirect_timeout: Duration,
  pub request_timeout: Duration,
  pub health_check_interval: Duration,
  pub merkle_sync_interval: Duration,
}
impl Default for StoreConfig {
  fn default() -> Self {
    StoreConfig {
      n: 3,
      r: 2,
      w: 2,
      vnodes: 3,
      client_timeout: Duration::from_millis(1000),
      redirect_timeout: Duration::from_millis(150),
      request_timeout: Duration::from_millis(150),
      health_check_interval: Duration::from_millis(300),
      merkle_sync_interval: Duration::from_millis(300),
    }
  }
}
impl StoreConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.n == 0
      || self.r < 1
      || self.r > self.n
      || self.w < 1
      || self.w > self.n
    {
      return Err(ConfigError::InvalidQuorum {
        n: self.n,
        r: self.r,
        w: self.w,
      });
    }
    Ok(())
  }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
  #[error("quorums must satisfy 1 <= r,w <= n (n = {n}, r = {r}, w = {w})")]
  InvalidQuorum { n: usize, r: usize, w: usize },
}

#[test]
fn test_validate_quorums() {
  assert_eq!(Ok(()), StoreConfig::default().validate());
  let mut bad = StoreConfig::default();
  bad.r = 4;
  assert_eq!(
    Err(ConfigError::InvalidQuorum { n: 3, r: 4, w: 2 }),
    bad.validate()
  );
  bad.r = 2;
  bad.w = 0;
  assert!(bad.validate().is_err());
}

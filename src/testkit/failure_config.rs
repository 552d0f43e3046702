use crate::core::NodeId;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env::var;
use std::time::Duration;

/// Cluster-wide drop probability taken from `REPLIKV_DROP_PROB`, for
/// fuzzing an existing test run without touching code.
pub static DROP_PROB: Lazy<f64> = Lazy::new(|| {
  var("REPLIKV_DROP_PROB")
    .map(|x| x.parse().ok())
    .ok()
    .flatten()
    .unwrap_or(0.0)
});

/// Delivery delay window from `REPLIKV_MIN_DELAY` / `REPLIKV_MAX_DELAY`,
/// in milliseconds.
pub static DELAY: Lazy<Option<(Duration, Duration)>> = Lazy::new(|| {
  var("REPLIKV_MIN_DELAY")
    .map(|x| x.parse().ok().map(Duration::from_millis))
    .ok()
    .flatten()
    .zip(
      var("REPLIKV_MAX_DELAY")
        .map(|x| x.parse().ok().map(Duration::from_millis))
        .ok()
        .flatten(),
    )
    .filter(|(x, y)| x <= y)
});

/// Dictates how sends to one destination misbehave.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug)]
pub struct FailureConfig {
  pub drop_prob: f64,
  pub delay: Option<(Duration, Duration)>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct FailureConfigMap {
  pub cluster_wide: FailureConfig,
  pub node_wide: im::HashMap<NodeId, FailureConfig>,
}
impl FailureConfigMap {
  pub fn get(&self, id: &NodeId) -> &FailureConfig {
    self.node_wide.get(id).unwrap_or(&self.cluster_wide)
  }

  pub fn from_env() -> FailureConfigMap {
    FailureConfigMap {
      cluster_wide: FailureConfig {
        drop_prob: *DROP_PROB,
        delay: *DELAY,
      },
      node_wide: im::HashMap::new(),
    }
  }
}

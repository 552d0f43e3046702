//! Tools for testing the store: failure injection for the bus, the
//! test/client principal that drives requests and observes responses, and
//! the workload harness measuring availability, inconsistency and stale
//! reads.

mod client;
mod failure_config;
mod workload;

#[rustfmt::skip]
pub use {
  client::ClientError,
  client::GetOk,
  client::KvClient,
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  failure_config::DELAY,
  failure_config::DROP_PROB,
  workload::measure,
  workload::Measurements,
  workload::WorkloadParams,
};

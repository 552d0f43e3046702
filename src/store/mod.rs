//! The replica state machine and its supporting data structures: vector
//! clocks and contexts, the append-only Merkle tree, the consistent-hash
//! ring, per-nonce request trackers, and the coordinator/participant
//! message handlers tying them together.

mod clock;
mod config;
mod merkle;
mod msg;
mod replica;
mod ring;
mod tracker;

use crate::core::LogLevel;

pub(crate) const LOG_LEVEL: LogLevel = LogLevel::Warn;

#[rustfmt::skip]
pub use {
  clock::ClockOrd,
  clock::Context,
  clock::VectorClock,
  config::ConfigError,
  config::StoreConfig,
  merkle::compare_trees,
  merkle::digest,
  merkle::leaf_digest,
  merkle::MerkleTree,
  merkle::TreeCmp,
  msg::ClientRequest,
  msg::Key,
  msg::Nonce,
  msg::ReqKind,
  msg::StateSnapshot,
  msg::StoreMsg,
  msg::Value,
  replica::merge_values,
  replica::Replica,
  replica::Stored,
  ring::NodeRing,
};

//! [`replikv`](crate) is a Dynamo-style eventually-consistent replicated
//! key-value store. Every node of a fixed cluster hosts an identical
//! [`Replica`](crate::store::Replica) state machine that coordinates quorum
//! reads and writes across a consistent-hash ring, tolerates crashes via
//! hinted handoff, reconciles divergent versions with vector clocks, and
//! repairs lagging replicas with Merkle-tree anti-entropy.
//!
//! # Modules
//! - [`core`](crate::core): the actor runtime: node identities, typed
//!   inboxes, timers as self-sent messages, and the in-process message bus
//!   the replicas talk over.
//! - [`store`](crate::store): the replica state machine and its supporting
//!   data structures (vector clocks, contexts, the hash ring, the
//!   append-only Merkle tree, pending-request trackers).
//! - [`testkit`](crate::testkit): failure injection for the bus, the
//!   test/client principal, and the workload harness that measures
//!   availability, inconsistency and stale reads.
//!
//! The transport is deliberately unreliable: sends may be dropped or
//! delayed according to a
//! [`FailureConfigMap`](crate::testkit::FailureConfigMap), and nodes may be
//! crashed and recovered at any point. The store is expected to stay safe
//! under every such interleaving; consistency is eventual, never strong.

pub mod core;
pub mod store;
pub mod testkit;

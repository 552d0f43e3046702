//! The actor runtime replicas run on: node identities, typed inboxes
//! consumed one message at a time, timers delivered as self-sent messages,
//! and the in-process message bus. The bus is unreliable on purpose; see
//! [`crate::testkit`] for the failure knobs.

mod actor;
mod logging;
mod net;

#[rustfmt::skip]
pub use {
  actor::Actor,
  actor::ActorContext,
  actor::Envelope,
  actor::LocalRef,
  actor::NodeId,
  logging::LogLevel,
  logging::Logger,
  logging::LoggerMsg,
  net::Net,
};

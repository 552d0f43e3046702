use crate::core::NodeId;
use tokio::sync::mpsc::{self, UnboundedSender};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
  Fatal,
  Off,
}
impl LogLevel {
  pub const MIN: LogLevel = LogLevel::Trace;
}

pub enum LoggerMsg {
  Log(LogLevel, NodeId, String),
  SetLevel(LogLevel),
}

/// Serializes log output from all nodes on one task so lines never
/// interleave mid-message.
pub struct Logger {
  level: LogLevel,
}
impl Logger {
  pub fn new(level: LogLevel) -> Self {
    Logger { level: level }
  }

  pub(crate) fn spawn(level: LogLevel) -> UnboundedSender<LoggerMsg> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut logger = Logger::new(level);
    tokio::spawn(async move {
      while let Some(msg) = rx.recv().await {
        logger.recv(msg);
      }
    });
    tx
  }

  fn recv(&mut self, msg: LoggerMsg) {
    match msg {
      LoggerMsg::Log(level, node, s) => {
        if level >= self.level {
          println!("{:?} {}: {}", level, node, s);
        }
      }
      LoggerMsg::SetLevel(level) => self.level = level,
    }
  }
}

#[macro_export]
macro_rules! trace {
  ($min:expr, $ctx:expr, $msg:expr) => {
    if $crate::core::LogLevel::Trace >= $min {
      $ctx.log($crate::core::LogLevel::Trace, $msg);
    }
  };
}

#[macro_export]
macro_rules! debug {
  ($min:expr, $ctx:expr, $msg:expr) => {
    if $crate::core::LogLevel::Debug >= $min {
      $ctx.log($crate::core::LogLevel::Debug, $msg);
    }
  };
}

#[macro_export]
macro_rules! info {
  ($min:expr, $ctx:expr, $msg:expr) => {
    if $crate::core::LogLevel::Info >= $min {
      $ctx.log($crate::core::LogLevel::Info, $msg);
    }
  };
}

#[macro_export]
macro_rules! warn {
  ($min:expr, $ctx:expr, $msg:expr) => {
    if $crate::core::LogLevel::Warn >= $min {
      $ctx.log($crate::core::LogLevel::Warn, $msg);
    }
  };
}

#[macro_export]
macro_rules! error {
  ($min:expr, $ctx:expr, $msg:expr) => {
    if $crate::core::LogLevel::Error >= $min {
      $ctx.log($crate::core::LogLevel::Error, $msg);
    }
  };
}

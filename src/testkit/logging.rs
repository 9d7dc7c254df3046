use once_cell::sync::Lazy;
use std::env::var;
use std::str::FromStr;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// The runtime log level picked up from `CONCLAVE_LOG` when a cluster does
/// not set one explicitly.
pub static DEFAULT_LOG_LEVEL: Lazy<LogLevel> = Lazy::new(|| {
  var("CONCLAVE_LOG")
    .map(|x| x.parse().ok())
    .ok()
    .flatten()
    .unwrap_or(LogLevel::Warn)
});

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
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
impl FromStr for LogLevel {
  type Err = String;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "trace" => Ok(LogLevel::Trace),
      "debug" => Ok(LogLevel::Debug),
      "info" => Ok(LogLevel::Info),
      "warn" => Ok(LogLevel::Warn),
      "error" => Ok(LogLevel::Error),
      "fatal" => Ok(LogLevel::Fatal),
      "off" => Ok(LogLevel::Off),
      other => Err(format!("not a log level: {}", other)),
    }
  }
}

pub enum LoggerMsg {
  Log(LogLevel, Box<dyn ToString + Send + 'static>),
  SetLevel(LogLevel),
}

/// Handle to a node's logger task. Cheap to clone; dropping every handle
/// stops the task.
#[derive(Clone)]
pub struct LoggerRef {
  tx: UnboundedSender<LoggerMsg>,
}
impl LoggerRef {
  pub fn log(&self, msg: LoggerMsg) -> bool {
    self.tx.send(msg).is_ok()
  }

  pub fn set_level(&self, level: LogLevel) -> bool {
    self.log(LoggerMsg::SetLevel(level))
  }
}

/// One logger task per cluster instance, draining log messages so callers
/// never block on stderr.
pub struct Logger {
  tag: String,
  level: LogLevel,
}
impl Logger {
  pub fn spawn(tag: impl Into<String>, level: LogLevel) -> LoggerRef {
    let (tx, rx) = unbounded_channel();
    let logger = Logger {
      tag: tag.into(),
      level: level,
    };
    tokio::spawn(logger.run(rx));
    LoggerRef { tx: tx }
  }

  async fn run(mut self, mut rx: UnboundedReceiver<LoggerMsg>) {
    while let Some(msg) = rx.recv().await {
      match msg {
        LoggerMsg::Log(level, s) => {
          if level >= self.level {
            eprintln!("[{:?}] {}: {}", level, self.tag, s.to_string());
          }
        }
        LoggerMsg::SetLevel(level) => self.level = level,
      }
    }
  }
}

/// The log macros forward to a [`LoggerRef`] when the message's level passes
/// the calling module's compile-time floor.
#[macro_export]
macro_rules! trace {
  ($floor:expr, $logger:expr, $msg:expr) => {{
    if $crate::testkit::LogLevel::Trace >= $floor {
      $logger.log($crate::testkit::LoggerMsg::Log(
        $crate::testkit::LogLevel::Trace,
        Box::new($msg),
      ));
    }
  }};
}

#[macro_export]
macro_rules! debug {
  ($floor:expr, $logger:expr, $msg:expr) => {{
    if $crate::testkit::LogLevel::Debug >= $floor {
      $logger.log($crate::testkit::LoggerMsg::Log(
        $crate::testkit::LogLevel::Debug,
        Box::new($msg),
      ));
    }
  }};
}

#[macro_export]
macro_rules! info {
  ($floor:expr, $logger:expr, $msg:expr) => {{
    if $crate::testkit::LogLevel::Info >= $floor {
      $logger.log($crate::testkit::LoggerMsg::Log(
        $crate::testkit::LogLevel::Info,
        Box::new($msg),
      ));
    }
  }};
}

#[macro_export]
macro_rules! warn {
  ($floor:expr, $logger:expr, $msg:expr) => {{
    if $crate::testkit::LogLevel::Warn >= $floor {
      $logger.log($crate::testkit::LoggerMsg::Log(
        $crate::testkit::LogLevel::Warn,
        Box::new($msg),
      ));
    }
  }};
}

#[macro_export]
macro_rules! error {
  ($floor:expr, $logger:expr, $msg:expr) => {{
    if $crate::testkit::LogLevel::Error >= $floor {
      $logger.log($crate::testkit::LoggerMsg::Log(
        $crate::testkit::LogLevel::Error,
        Box::new($msg),
      ));
    }
  }};
}

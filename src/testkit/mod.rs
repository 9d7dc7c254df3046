mod logging;

#[rustfmt::skip]
pub use {
  logging::DEFAULT_LOG_LEVEL,
  logging::LogLevel,
  logging::Logger,
  logging::LoggerMsg,
  logging::LoggerRef,
};

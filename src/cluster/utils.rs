use crate::core::AddrInfo;
use crate::testkit::{LogLevel, DEFAULT_LOG_LEVEL};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Construction-time options shared by founders and joiners.
pub struct ClusterConfig {
  /// TCP port to listen on. 0 picks an ephemeral port.
  pub port: u16,
  /// The IPv4 address peers should dial back; goes into our wire address.
  pub advertise_ip: Ipv4Addr,
  /// Runtime log threshold for this node's logger.
  pub log_level: LogLevel,
}
impl Default for ClusterConfig {
  fn default() -> Self {
    ClusterConfig {
      port: 0,
      advertise_ip: Ipv4Addr::LOCALHOST,
      log_level: *DEFAULT_LOG_LEVEL,
    }
  }
}

/// Membership changes published to [`Cluster::subscribe`] receivers.
///
/// [`Cluster::subscribe`]: crate::cluster::Cluster::subscribe
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum ClusterEvent {
  PeerJoined(AddrInfo),
  PeerKilled(AddrInfo),
}

/// The application hook behind cluster bootstrap: whatever bytes
/// `introduction` returns are streamed to each joiner, whose startup
/// function consumes them to build its own delegate.
pub trait Delegate: Send + Sync + 'static {
  fn introduction(&self) -> Vec<u8>;
}

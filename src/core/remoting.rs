use crate::core::ClusterError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use tokio::net::lookup_host;

/// Identifies one member of the cluster. Ids are dense, assigned in
/// increasing order by the node that first proposes the member, and never
/// reused for the lifetime of the cluster.
pub type PeerId = i64;

/// The id a joiner puts on the wire before it has been assigned one. Never
/// present in a membership map.
pub const UNASSIGNED: PeerId = -1;

/// The DNS name or IP address of a machine hosting a cluster node. Used for
/// the contact argument of a join; wire addresses are always raw IPv4.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Host {
  DNS(String),
  IP(IpAddr),
}
impl Host {
  /// Resolves this host against a port. Only errs if the DNS lookup fails.
  pub async fn as_addr(&self, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    match self {
      Host::IP(ip) => Ok(vec![SocketAddr::new(*ip, port)]),
      Host::DNS(s) => lookup_host((s.as_str(), port))
        .await
        .map(|x| x.filter(|a| a.is_ipv4()).collect()),
    }
  }
}
impl From<String> for Host {
  fn from(s: String) -> Self {
    match IpAddr::from_str(s.as_str()) {
      Ok(ip) => Host::IP(ip),
      Err(_) => Host::DNS(s),
    }
  }
}
impl fmt::Display for Host {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Host::DNS(s) => write!(f, "DNS({})", s),
      Host::IP(ip) => write!(f, "IP({})", ip),
    }
  }
}

/// A peer's wire address: IPv4 address, listening port and assigned id.
/// This is the exact shape that travels in every membership frame.
#[derive(
  Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
  Serialize,
)]
pub struct AddrInfo {
  pub ip: u32,
  pub port: u16,
  pub id: PeerId,
}
impl AddrInfo {
  pub fn new(ip: Ipv4Addr, port: u16, id: PeerId) -> AddrInfo {
    AddrInfo {
      ip: u32::from(ip),
      port: port,
      id: id,
    }
  }

  pub fn ipv4(&self) -> Ipv4Addr {
    Ipv4Addr::from(self.ip)
  }

  /// The raw socket address this peer accepts connections on.
  pub fn socket_addr(&self) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(self.ipv4()), self.port)
  }

  /// Same endpoint, different id. Used when an admission round advances its
  /// candidate id.
  pub fn with_id(self, id: PeerId) -> AddrInfo {
    AddrInfo { id: id, ..self }
  }

  /// Whether two addresses name the same endpoint, ignoring the id.
  pub fn same_endpoint(&self, other: &AddrInfo) -> bool {
    self.ip == other.ip && self.port == other.port
  }
}
impl fmt::Display for AddrInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}#{}", self.ipv4(), self.port, self.id)
  }
}

/// Encodes a message body for the wire.
pub fn serialize<T>(item: &T) -> Result<Vec<u8>, ClusterError>
where
  T: Serialize,
{
  serde_cbor::to_vec(item).map_err(|e| ClusterError::Encode(e.to_string()))
}

/// Decodes a message body from the wire.
pub fn deserialize<T>(bytes: &[u8]) -> Result<T, ClusterError>
where
  T: DeserializeOwned,
{
  serde_cbor::from_slice(bytes).map_err(|e| ClusterError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn addr_info_endpoint_ignores_id() {
    let a = AddrInfo::new(Ipv4Addr::new(10, 0, 0, 1), 17010, 3);
    assert!(a.same_endpoint(&a.with_id(7)));
    assert_eq!(a.with_id(7).id, 7);
    assert_eq!(a.with_id(7).port, a.port);
    let b = AddrInfo::new(Ipv4Addr::new(10, 0, 0, 2), 17010, 3);
    assert!(!a.same_endpoint(&b));
  }

  #[test]
  fn host_from_string() {
    assert_eq!(
      Host::from("127.0.0.1".to_string()),
      Host::IP(IpAddr::V4(Ipv4Addr::LOCALHOST))
    );
    assert_eq!(
      Host::from("db-3.internal".to_string()),
      Host::DNS("db-3.internal".to_string())
    );
  }
}

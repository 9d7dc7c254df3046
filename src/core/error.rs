use crate::core::{MailboxId, PeerId};
use thiserror::Error;

/// Every failure surfaced by the cluster core.
///
/// Transport and decode failures are caught at the owning peer's service
/// loop and converted into eviction of that peer; the remaining variants
/// surface through the user-facing API.
#[derive(Debug, Error)]
pub enum ClusterError {
  /// The remote end closed the connection, or the network failed.
  #[error("transport closed by peer")]
  TransportClosed,
  /// A frame was malformed or truncated mid-read.
  #[error("malformed frame: {0}")]
  Framing(&'static str),
  /// A frame body did not decode as the expected message.
  #[error("could not decode message: {0}")]
  Decode(String),
  /// A message could not be encoded for the wire.
  #[error("could not encode message: {0}")]
  Encode(String),
  /// No mailbox is registered under this id.
  #[error("no mailbox registered with id {0}")]
  UnknownMailbox(MailboxId),
  /// No peer is known under this id.
  #[error("no peer known with id {0}")]
  UnknownPeer(PeerId),
  /// The peer exists but is not in a state that can carry user messages.
  #[error("peer {0} is not connected")]
  NotConnected(PeerId),
  /// The protocol reached a state the design treats as unresolvable.
  #[error("protocol violation: {0}")]
  Protocol(String),
  /// The cluster is shutting down; no further sends or admissions.
  #[error("cluster is draining")]
  Draining,
  /// An I/O failure outside of framed reads and writes.
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

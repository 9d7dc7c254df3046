use crate::cluster::MsgService;
use crate::core::{
  read_msg, write_msg, AddrInfo, ClusterError, MsgKind, PeerId, Pulse, WireMsg,
};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// The receive half of a peer connection, handed to services that consume
/// payload bytes following a header frame.
pub type PayloadReader = OwnedReadHalf;

/// The lifecycle of a membership record. The machine only moves forward:
///
/// `JoinProposed → JoinOfficial → Connected → KillProposed → Killed`
///
/// `Us` marks the local node's own record. Killed records stay in the
/// membership map as tombstones so ids are never reused.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum PeerState {
  JoinProposed,
  JoinOfficial,
  Connected,
  Us,
  KillProposed,
  Killed,
}

/// One remote member: its wire address, connection, state and the services
/// dispatching its inbound frames. The membership registry is the unique
/// owner; everything else holds `Arc` handles validated by state on use.
pub struct Peer {
  addr: AddrInfo,
  state: Mutex<PeerState>,
  writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
  services: Mutex<Vec<Arc<dyn MsgService>>>,
  /// Pulsed when the peer leaves service; the serve loop selects on it.
  pub(crate) downed: Pulse,
}
impl Peer {
  pub(crate) fn new(addr: AddrInfo, state: PeerState) -> Arc<Peer> {
    Arc::new(Peer {
      addr: addr,
      state: Mutex::new(state),
      writer: tokio::sync::Mutex::new(None),
      services: Mutex::new(Vec::new()),
      downed: Pulse::new(),
    })
  }

  pub fn addr(&self) -> AddrInfo {
    self.addr
  }

  pub fn id(&self) -> PeerId {
    self.addr.id
  }

  pub fn state(&self) -> PeerState {
    *self.state.lock().unwrap()
  }

  pub(crate) fn set_state(&self, state: PeerState) {
    *self.state.lock().unwrap() = state;
  }

  /// Opens the outbound connection to this peer and runs the initial
  /// exchange: send `JoinInitial` carrying our address, read its echo.
  /// Returns the read half; the write half is installed as this peer's
  /// writer.
  pub(crate) async fn connect(
    &self,
    our_addr: AddrInfo,
  ) -> Result<OwnedReadHalf, ClusterError> {
    let mut stream = TcpStream::connect(self.addr.socket_addr()).await?;
    write_msg(&mut stream, &WireMsg::JoinInitial { addr: our_addr }).await?;
    match read_msg(&mut stream).await? {
      WireMsg::JoinInitial { .. } => {}
      other => {
        return Err(ClusterError::Protocol(format!(
          "peer {} answered the initial exchange with {:?}",
          self.addr,
          other.kind()
        )))
      }
    }
    Ok(self.adopt(stream).await)
  }

  /// Takes ownership of an established connection, installing its write
  /// half behind the write lock.
  pub(crate) async fn adopt(&self, stream: TcpStream) -> OwnedReadHalf {
    let (reader, writer) = stream.into_split();
    *self.writer.lock().await = Some(writer);
    reader
  }

  /// Writes one framed message. The write lock serializes concurrent
  /// senders; the lock is FIFO-fair, so heavy senders cannot starve a
  /// protocol round.
  pub(crate) async fn write(&self, msg: &WireMsg) -> Result<(), ClusterError> {
    let mut guard = self.writer.lock().await;
    match guard.as_mut() {
      Some(w) => write_msg(w, msg).await,
      None => Err(ClusterError::TransportClosed),
    }
  }

  /// Writes a header frame and its raw payload bytes under one lock
  /// acquisition, so the pair is contiguous on the wire.
  pub(crate) async fn write_with_payload(
    &self,
    header: &WireMsg,
    payload: &[u8],
  ) -> Result<(), ClusterError> {
    let mut guard = self.writer.lock().await;
    match guard.as_mut() {
      Some(w) => {
        write_msg(w, header).await?;
        w.write_all(payload)
          .await
          .map_err(|_| ClusterError::TransportClosed)
      }
      None => Err(ClusterError::TransportClosed),
    }
  }

  /// Drops the write half and pulses `downed`. The remote end observes the
  /// close as an EOF on its next read.
  pub(crate) async fn close(&self) {
    *self.writer.lock().await = None;
    self.downed.pulse();
  }

  pub(crate) fn add_srvc(&self, srvc: Arc<dyn MsgService>) {
    self.services.lock().unwrap().push(srvc);
  }

  pub(crate) fn remove_srvc(&self, srvc: &Arc<dyn MsgService>) {
    self
      .services
      .lock()
      .unwrap()
      .retain(|s| !Arc::ptr_eq(s, srvc));
  }

  /// The first registered service accepting this kind, in registration
  /// order.
  pub(crate) fn srvc_for(&self, kind: MsgKind) -> Option<Arc<dyn MsgService>> {
    self
      .services
      .lock()
      .unwrap()
      .iter()
      .find(|s| s.kind() == kind)
      .cloned()
  }

  /// Drops every service this peer holds, abandoning one-shots so protocol
  /// barriers waiting on this peer complete instead of hanging.
  pub(crate) fn shed_services(&self) {
    let services = std::mem::take(&mut *self.services.lock().unwrap());
    for srvc in services {
      if srvc.one_shot() {
        srvc.abandon();
      }
    }
  }
}

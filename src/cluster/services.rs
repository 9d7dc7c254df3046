use crate::cluster::{Cluster, PayloadReader, Peer, PeerState, LOG_LEVEL};
use crate::core::{read_payload, ClusterError, Delivery, MsgKind, WireMsg};
use crate::{info, warn};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// An inbound-message handler bound to exactly one wire kind, attached per
/// peer. Dispatch hands a service the decoded frame and the connection's
/// read half, from which it may consume payload bytes announced by the
/// frame.
///
/// The five membership services are built in and attached to every peer
/// before it is serviced; user services join them through
/// [`Cluster::add_service`].
#[async_trait]
pub trait MsgService: Send + Sync {
  /// The one wire kind this service accepts.
  fn kind(&self) -> MsgKind;

  /// One-shot services remove themselves from a peer after handling a
  /// single message; protocol barriers are built from them.
  fn one_shot(&self) -> bool {
    false
  }

  /// Called instead of `handle` when the peer dies while this one-shot is
  /// still attached.
  fn abandon(&self) {}

  async fn handle(
    &self,
    cluster: &Cluster,
    peer: &Arc<Peer>,
    msg: WireMsg,
    reader: &mut PayloadReader,
  ) -> Result<(), ClusterError>;
}

/// Votes on admission proposals from any peer.
pub(crate) struct JoinProposeSrvc;
#[async_trait]
impl MsgService for JoinProposeSrvc {
  fn kind(&self) -> MsgKind {
    MsgKind::JoinPropose
  }

  async fn handle(
    &self,
    cluster: &Cluster,
    peer: &Arc<Peer>,
    msg: WireMsg,
    _reader: &mut PayloadReader,
  ) -> Result<(), ClusterError> {
    let addr = match msg {
      WireMsg::JoinPropose { addr } => addr,
      _ => unreachable!("bound to JoinPropose"),
    };
    let accepted = cluster.core.membership.try_admit(addr);
    info!(
      LOG_LEVEL,
      cluster.core.logger,
      format!(
        "{} the proposal of {} from peer {}",
        if accepted { "accepted" } else { "rejected" },
        addr,
        peer.id()
      )
    );
    peer.write(&WireMsg::JoinRespond { accepted: accepted }).await
  }
}

/// Records unanimously accepted admissions and acknowledges them.
pub(crate) struct JoinMkOfficialSrvc;
#[async_trait]
impl MsgService for JoinMkOfficialSrvc {
  fn kind(&self) -> MsgKind {
    MsgKind::JoinMkOfficial
  }

  async fn handle(
    &self,
    cluster: &Cluster,
    peer: &Arc<Peer>,
    msg: WireMsg,
    _reader: &mut PayloadReader,
  ) -> Result<(), ClusterError> {
    let addr = match msg {
      WireMsg::JoinMkOfficial { addr } => addr,
      _ => unreachable!("bound to JoinMkOfficial"),
    };
    cluster.core.membership.make_official(addr);
    info!(
      LOG_LEVEL,
      cluster.core.logger,
      format!("peer {} is official", addr)
    );
    peer.write(&WireMsg::JoinAckOfficial { addr: addr }).await
  }
}

/// Votes on kill proposals. The only refusal is a proposal naming this node
/// itself, which the initiator treats as a protocol violation.
pub(crate) struct KillProposeSrvc;
#[async_trait]
impl MsgService for KillProposeSrvc {
  fn kind(&self) -> MsgKind {
    MsgKind::KillPropose
  }

  async fn handle(
    &self,
    cluster: &Cluster,
    peer: &Arc<Peer>,
    msg: WireMsg,
    _reader: &mut PayloadReader,
  ) -> Result<(), ClusterError> {
    let addr = match msg {
      WireMsg::KillPropose { addr } => addr,
      _ => unreachable!("bound to KillPropose"),
    };
    let accepted = addr.id != cluster.core.us;
    if !accepted {
      warn!(
        LOG_LEVEL,
        cluster.core.logger,
        format!("peer {} proposed killing us", peer.id())
      );
    }
    peer.write(&WireMsg::KillRespond { accepted: accepted }).await
  }
}

/// Applies unanimously accepted kills: the target becomes a tombstone.
pub(crate) struct KillMkOfficialSrvc;
#[async_trait]
impl MsgService for KillMkOfficialSrvc {
  fn kind(&self) -> MsgKind {
    MsgKind::KillMkOfficial
  }

  async fn handle(
    &self,
    cluster: &Cluster,
    _peer: &Arc<Peer>,
    msg: WireMsg,
    _reader: &mut PayloadReader,
  ) -> Result<(), ClusterError> {
    let addr = match msg {
      WireMsg::KillMkOfficial { addr } => addr,
      _ => unreachable!("bound to KillMkOfficial"),
    };
    if let Some(target) = cluster.core.membership.get(addr.id) {
      cluster.finish_kill(&target).await;
    }
    Ok(())
  }
}

/// Delivers mailbox payloads to local handlers. Payload bytes are consumed
/// even when the mailbox is unknown, so the stream stays in sync.
pub(crate) struct MailboxDeliverSrvc;
#[async_trait]
impl MsgService for MailboxDeliverSrvc {
  fn kind(&self) -> MsgKind {
    MsgKind::Mailbox
  }

  async fn handle(
    &self,
    cluster: &Cluster,
    peer: &Arc<Peer>,
    msg: WireMsg,
    reader: &mut PayloadReader,
  ) -> Result<(), ClusterError> {
    let (id, length, type_name) = match msg {
      WireMsg::MailboxMsg {
        id,
        length,
        type_name,
      } => (id, length, type_name),
      _ => unreachable!("bound to MailboxMsg"),
    };
    if peer.state() != PeerState::Connected {
      return Err(ClusterError::NotConnected(peer.id()));
    }
    let payload = read_payload(reader, length).await?;
    match cluster.core.mailboxes.get(id) {
      Some(recvr) => {
        // handlers run on their own task, never inline with the serve loop
        tokio::spawn(async move { recvr(Delivery::Remote(payload)) });
      }
      None => warn!(
        LOG_LEVEL,
        cluster.core.logger,
        format!(
          "dropping {} bytes for unknown mailbox {}{}",
          length,
          id,
          type_name.map(|t| format!(" ({})", t)).unwrap_or_default()
        )
      ),
    }
    Ok(())
  }
}

/// One-shot collector for [`WireMsg::JoinRespond`] votes during an
/// admission round.
pub(crate) struct JoinRespondSrvc {
  tx: UnboundedSender<bool>,
}
impl JoinRespondSrvc {
  pub fn new(tx: UnboundedSender<bool>) -> JoinRespondSrvc {
    JoinRespondSrvc { tx: tx }
  }
}
#[async_trait]
impl MsgService for JoinRespondSrvc {
  fn kind(&self) -> MsgKind {
    MsgKind::JoinRespond
  }

  fn one_shot(&self) -> bool {
    true
  }

  fn abandon(&self) {
    // a voter that died mid-round leaves the expected set
    let _ = self.tx.send(true);
  }

  async fn handle(
    &self,
    _cluster: &Cluster,
    _peer: &Arc<Peer>,
    msg: WireMsg,
    _reader: &mut PayloadReader,
  ) -> Result<(), ClusterError> {
    if let WireMsg::JoinRespond { accepted } = msg {
      let _ = self.tx.send(accepted);
    }
    Ok(())
  }
}

/// One-shot collector for [`WireMsg::JoinAckOfficial`] acknowledgements.
pub(crate) struct JoinAckOfficialSrvc {
  tx: UnboundedSender<bool>,
}
impl JoinAckOfficialSrvc {
  pub fn new(tx: UnboundedSender<bool>) -> JoinAckOfficialSrvc {
    JoinAckOfficialSrvc { tx: tx }
  }
}
#[async_trait]
impl MsgService for JoinAckOfficialSrvc {
  fn kind(&self) -> MsgKind {
    MsgKind::JoinAckOfficial
  }

  fn one_shot(&self) -> bool {
    true
  }

  fn abandon(&self) {
    let _ = self.tx.send(true);
  }

  async fn handle(
    &self,
    _cluster: &Cluster,
    _peer: &Arc<Peer>,
    _msg: WireMsg,
    _reader: &mut PayloadReader,
  ) -> Result<(), ClusterError> {
    let _ = self.tx.send(true);
    Ok(())
  }
}

/// One-shot collector for [`WireMsg::KillRespond`] votes during an eviction
/// round.
pub(crate) struct KillRespondSrvc {
  tx: UnboundedSender<bool>,
}
impl KillRespondSrvc {
  pub fn new(tx: UnboundedSender<bool>) -> KillRespondSrvc {
    KillRespondSrvc { tx: tx }
  }
}
#[async_trait]
impl MsgService for KillRespondSrvc {
  fn kind(&self) -> MsgKind {
    MsgKind::KillRespond
  }

  fn one_shot(&self) -> bool {
    true
  }

  fn abandon(&self) {
    let _ = self.tx.send(true);
  }

  async fn handle(
    &self,
    _cluster: &Cluster,
    _peer: &Arc<Peer>,
    msg: WireMsg,
    _reader: &mut PayloadReader,
  ) -> Result<(), ClusterError> {
    if let WireMsg::KillRespond { accepted } = msg {
      let _ = self.tx.send(accepted);
    }
    Ok(())
  }
}

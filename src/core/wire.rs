use crate::core::{AddrInfo, MailboxId};
use serde::{Deserialize, Serialize};

/// How a welcome describes an existing peer to a joiner.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Liveness {
  Live,
  Killed,
}

/// One membership entry inside a [`WireMsg::JoinWelcome`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WelcomePeer {
  pub addr: AddrInfo,
  pub state: Liveness,
}

/// Every frame that can appear on a peer connection. Each frame travels as a
/// big-endian `u32` length followed by its encoded body.
///
/// `IntroMsg` and `MailboxMsg` are headers: the raw bytes they announce
/// follow them on the stream, outside of any frame, and the handling service
/// consumes exactly that many.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum WireMsg {
  /// First frame on every connection; `addr.id` is [`UNASSIGNED`] when the
  /// sender has not been admitted yet.
  ///
  /// [`UNASSIGNED`]: crate::core::UNASSIGNED
  JoinInitial { addr: AddrInfo },
  /// The contact's reply to an admitted joiner: its assigned address and
  /// the whole membership.
  JoinWelcome {
    assigned: AddrInfo,
    peers: Vec<WelcomePeer>,
  },
  /// Phase one of admission: ask a member to accept a candidate.
  JoinPropose { addr: AddrInfo },
  /// A member's vote on a proposal.
  JoinRespond { accepted: bool },
  /// Phase two of admission: the candidate was unanimously accepted.
  JoinMkOfficial { addr: AddrInfo },
  /// Acknowledges a [`WireMsg::JoinMkOfficial`].
  JoinAckOfficial { addr: AddrInfo },
  /// Phase one of eviction: ask a member to accept a kill.
  KillPropose { addr: AddrInfo },
  /// A member's vote on a kill.
  KillRespond { accepted: bool },
  /// Phase two of eviction: the kill was unanimously accepted.
  KillMkOfficial { addr: AddrInfo },
  /// Announces `length` bytes of delegate introduction following this frame.
  IntroMsg { length: u64 },
  /// Announces a mailbox delivery: `length` payload bytes follow this frame.
  /// `type_name` is attached in debug builds only.
  MailboxMsg {
    id: MailboxId,
    length: u64,
    type_name: Option<String>,
  },
}

/// The dispatch tag of a frame. Each service is bound to exactly one kind.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MsgKind {
  JoinInitial,
  JoinWelcome,
  JoinPropose,
  JoinRespond,
  JoinMkOfficial,
  JoinAckOfficial,
  KillPropose,
  KillRespond,
  KillMkOfficial,
  Intro,
  Mailbox,
}

impl WireMsg {
  pub fn kind(&self) -> MsgKind {
    match self {
      WireMsg::JoinInitial { .. } => MsgKind::JoinInitial,
      WireMsg::JoinWelcome { .. } => MsgKind::JoinWelcome,
      WireMsg::JoinPropose { .. } => MsgKind::JoinPropose,
      WireMsg::JoinRespond { .. } => MsgKind::JoinRespond,
      WireMsg::JoinMkOfficial { .. } => MsgKind::JoinMkOfficial,
      WireMsg::JoinAckOfficial { .. } => MsgKind::JoinAckOfficial,
      WireMsg::KillPropose { .. } => MsgKind::KillPropose,
      WireMsg::KillRespond { .. } => MsgKind::KillRespond,
      WireMsg::KillMkOfficial { .. } => MsgKind::KillMkOfficial,
      WireMsg::IntroMsg { .. } => MsgKind::Intro,
      WireMsg::MailboxMsg { .. } => MsgKind::Mailbox,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::{deserialize, serialize, UNASSIGNED};
  use std::net::Ipv4Addr;

  #[test]
  fn wire_round_trip() {
    let addr = AddrInfo::new(Ipv4Addr::new(192, 168, 4, 20), 17010, UNASSIGNED);
    let msgs = vec![
      WireMsg::JoinInitial { addr: addr },
      WireMsg::JoinWelcome {
        assigned: addr.with_id(2),
        peers: vec![
          WelcomePeer {
            addr: addr.with_id(0),
            state: Liveness::Live,
          },
          WelcomePeer {
            addr: addr.with_id(1),
            state: Liveness::Killed,
          },
        ],
      },
      WireMsg::KillPropose {
        addr: addr.with_id(1),
      },
      WireMsg::MailboxMsg {
        id: 4,
        length: 117,
        type_name: Some("stats::Sample".to_string()),
      },
    ];
    for msg in msgs {
      let bytes = serialize(&msg).unwrap();
      assert_eq!(msg, deserialize::<WireMsg>(&bytes[..]).unwrap());
    }
  }
}

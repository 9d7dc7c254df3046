mod error;
mod framing;
mod mailbox;
mod remoting;
mod signal;
mod wire;

pub(crate) const LOG_LEVEL: crate::testkit::LogLevel =
  crate::testkit::LogLevel::Info;

#[rustfmt::skip]
pub use {
  error::ClusterError,
  framing::IntroPipe,
  framing::MAX_FRAME_LEN,
  mailbox::ClusterAddress,
  mailbox::Mailbox,
  mailbox::MailboxId,
  remoting::AddrInfo,
  remoting::Host,
  remoting::PeerId,
  remoting::UNASSIGNED,
  remoting::deserialize,
  remoting::serialize,
  signal::Pulse,
  wire::Liveness,
  wire::MsgKind,
  wire::WelcomePeer,
  wire::WireMsg,
};

#[rustfmt::skip]
pub(crate) use {
  framing::read_msg,
  framing::read_payload,
  framing::write_msg,
  mailbox::Delivery,
  mailbox::MailboxMap,
};

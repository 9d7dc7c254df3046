mod cluster;
mod membership;
mod peer;
mod registration;
mod services;
mod utils;

use crate::testkit::LogLevel;

pub(crate) const LOG_LEVEL: LogLevel = LogLevel::Info;

#[rustfmt::skip]
pub use {
  cluster::Cluster,
  peer::PayloadReader,
  peer::Peer,
  peer::PeerState,
  registration::Directory,
  registration::Registrant,
  registration::Registrar,
  registration::RegistrarCard,
  registration::RegistrationController,
  registration::RegistrationId,
  services::MsgService,
  utils::ClusterConfig,
  utils::ClusterEvent,
  utils::Delegate,
};

#[rustfmt::skip]
pub(crate) use {
  membership::Membership,
  services::JoinAckOfficialSrvc,
  services::JoinMkOfficialSrvc,
  services::JoinProposeSrvc,
  services::JoinRespondSrvc,
  services::KillMkOfficialSrvc,
  services::KillProposeSrvc,
  services::KillRespondSrvc,
  services::MailboxDeliverSrvc,
};

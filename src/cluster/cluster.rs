use crate::cluster::{
  ClusterConfig, ClusterEvent, Delegate, JoinAckOfficialSrvc, JoinMkOfficialSrvc,
  JoinProposeSrvc, JoinRespondSrvc, KillMkOfficialSrvc, KillProposeSrvc,
  KillRespondSrvc, MailboxDeliverSrvc, Membership, MsgService, Peer, PeerState,
  LOG_LEVEL,
};
use crate::core::{
  read_msg, write_msg, AddrInfo, ClusterAddress, ClusterError, Host, IntroPipe,
  Liveness, Mailbox, MailboxMap, PeerId, Pulse, WelcomePeer, WireMsg,
  UNASSIGNED,
};
use crate::core::{serialize, Delivery};
use crate::testkit::{Logger, LoggerMsg, LoggerRef};
use crate::{debug, error, info, trace, warn};
use itertools::Itertools;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{
  unbounded_channel, UnboundedReceiver, UnboundedSender,
};

pub(crate) struct ClusterCore {
  pub(crate) us: PeerId,
  pub(crate) our_addr: AddrInfo,
  pub(crate) membership: Membership,
  pub(crate) mailboxes: Arc<MailboxMap>,
  pub(crate) delegate: OnceCell<Arc<dyn Delegate>>,
  pub(crate) added_srvcs: Mutex<Vec<Arc<dyn MsgService>>>,
  pub(crate) subscribers: Mutex<Vec<UnboundedSender<ClusterEvent>>>,
  pub(crate) drain: Pulse,
  pub(crate) logger: LoggerRef,
}
impl ClusterCore {
  fn new(our_addr: AddrInfo, logger: LoggerRef) -> Arc<ClusterCore> {
    Arc::new(ClusterCore {
      us: our_addr.id,
      our_addr: our_addr,
      membership: Membership::new(our_addr),
      mailboxes: MailboxMap::new(our_addr.id, logger.clone()),
      delegate: OnceCell::new(),
      added_srvcs: Mutex::new(Vec::new()),
      subscribers: Mutex::new(Vec::new()),
      drain: Pulse::new(),
      logger: logger,
    })
  }
}

/// A handle on this process's cluster instance. Cheap to clone; mailboxes,
/// services and protocol tasks all work through one shared core.
#[derive(Clone)]
pub struct Cluster {
  pub(crate) core: Arc<ClusterCore>,
}
impl Cluster {
  /// Founds a new cluster: bind the listening port and become its sole
  /// member with id 0. The delegate supplies the introduction stream served
  /// to every future joiner.
  pub async fn start(
    config: ClusterConfig,
    delegate: Arc<dyn Delegate>,
  ) -> Result<Cluster, ClusterError> {
    let listener =
      TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?;
    let port = listener.local_addr()?.port();
    let our_addr = AddrInfo::new(config.advertise_ip, port, 0);
    let logger = Logger::spawn(our_addr.to_string(), config.log_level);
    let core = ClusterCore::new(our_addr, logger);
    core.delegate.set(delegate).ok();
    let cluster = Cluster { core: core };
    cluster.spawn_accept_loop(listener);
    info!(
      LOG_LEVEL,
      cluster.core.logger,
      format!("founded a cluster on {}", our_addr)
    );
    Ok(cluster)
  }

  /// Joins the cluster reachable through `contact`. The contact admits us,
  /// assigns our id and sends the current membership; we then connect to
  /// every live peer and hand the introduction stream to `startup`, which
  /// builds this node's delegate. Returns once `startup` completes and the
  /// whole introduction has been consumed.
  pub async fn join<F, Fut>(
    config: ClusterConfig,
    contact: Host,
    contact_port: u16,
    startup: F,
  ) -> Result<Cluster, ClusterError>
  where
    F: FnOnce(IntroPipe) -> Fut,
    Fut: Future<Output = Result<Arc<dyn Delegate>, ClusterError>>,
  {
    let listener =
      TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?;
    let port = listener.local_addr()?.port();

    let addrs = contact.as_addr(contact_port).await?;
    let contact_addr = addrs.first().ok_or_else(|| {
      ClusterError::Protocol(format!("{} does not resolve", contact))
    })?;
    let mut contact_conn = TcpStream::connect(contact_addr).await?;
    write_msg(
      &mut contact_conn,
      &WireMsg::JoinInitial {
        addr: AddrInfo::new(config.advertise_ip, port, UNASSIGNED),
      },
    )
    .await?;
    let (assigned, welcomed) = match read_msg(&mut contact_conn).await? {
      WireMsg::JoinWelcome { assigned, peers } => (assigned, peers),
      other => {
        return Err(ClusterError::Protocol(format!(
          "expected a welcome, got {:?}",
          other.kind()
        )))
      }
    };

    let logger = Logger::spawn(assigned.to_string(), config.log_level);
    let core = ClusterCore::new(assigned, logger);
    let cluster = Cluster { core: core };
    info!(
      LOG_LEVEL,
      cluster.core.logger,
      format!("assigned id {}, connecting to {} peers", assigned.id, welcomed.len())
    );

    for entry in welcomed {
      if cluster.core.membership.get(entry.addr.id).is_some() {
        return Err(ClusterError::Protocol(format!(
          "duplicate entry {} in the welcome",
          entry.addr
        )));
      }
      match entry.state {
        Liveness::Live => {
          let peer = Peer::new(entry.addr, PeerState::JoinOfficial);
          cluster.core.membership.insert(peer.clone());
          let reader = peer.connect(assigned).await?;
          peer.set_state(PeerState::Connected);
          cluster.core.membership.pulse_peer_join(peer.id());
          cluster.notify(ClusterEvent::PeerJoined(peer.addr()));
          cluster.start_main_srvcs(peer, reader);
        }
        Liveness::Killed => {
          cluster
            .core
            .membership
            .insert(Peer::new(entry.addr, PeerState::Killed));
        }
      }
      cluster.log_peers();
    }

    let length = match read_msg(&mut contact_conn).await? {
      WireMsg::IntroMsg { length } => length,
      other => {
        return Err(ClusterError::Protocol(format!(
          "expected the introduction header, got {:?}",
          other.kind()
        )))
      }
    };
    let (pipe, remaining) = IntroPipe::new(contact_conn, length);
    let delegate = startup(pipe).await?;
    if remaining.load(Ordering::SeqCst) != 0 {
      return Err(ClusterError::Protocol(
        "the startup function left introduction bytes unconsumed".to_string(),
      ));
    }
    cluster.core.delegate.set(delegate).ok();

    cluster.spawn_accept_loop(listener);
    info!(
      LOG_LEVEL,
      cluster.core.logger,
      format!("joined the cluster as {}", assigned)
    );
    Ok(cluster)
  }

  /// The local node's id.
  pub fn us(&self) -> PeerId {
    self.core.us
  }

  /// The local node's wire address.
  pub fn addr(&self) -> AddrInfo {
    self.core.our_addr
  }

  /// Every known peer with its current state, in id order.
  pub fn peers(&self) -> Vec<(AddrInfo, PeerState)> {
    self
      .core
      .membership
      .snapshot()
      .iter()
      .map(|p| (p.addr(), p.state()))
      .collect_vec()
  }

  pub fn log(&self, msg: LoggerMsg) -> bool {
    self.core.logger.log(msg)
  }

  /// Registers a mailbox under the next unused id. The handler runs on a
  /// fresh task per delivery. Dropping the returned handle deregisters it.
  pub fn open_mailbox<M, F>(&self, handler: F) -> Mailbox<M>
  where
    M: DeserializeOwned + Send + 'static,
    F: Fn(M) + Send + Sync + 'static,
  {
    Mailbox::attach(self.core.mailboxes.clone(), handler)
  }

  /// Attaches a user service to every existing and future peer.
  pub fn add_service(&self, srvc: Arc<dyn MsgService>) {
    for peer in self.core.membership.snapshot() {
      peer.add_srvc(srvc.clone());
    }
    self.core.added_srvcs.lock().unwrap().push(srvc);
  }

  /// A stream of membership changes. The receiver is dropped from the
  /// subscriber list once it goes away.
  pub fn subscribe(&self) -> UnboundedReceiver<ClusterEvent> {
    let (tx, rx) = unbounded_channel();
    self.core.subscribers.lock().unwrap().push(tx);
    rx
  }

  pub(crate) fn notify(&self, event: ClusterEvent) {
    self
      .core
      .subscribers
      .lock()
      .unwrap()
      .retain(|s| s.send(event.clone()).is_ok());
  }

  /// Sends a message to a cluster address. A local destination dispatches
  /// the handler on a fresh task without touching the wire; a remote one
  /// writes a mailbox header and the encoded payload under the peer's write
  /// lock.
  pub async fn send<M>(
    &self,
    dst: ClusterAddress,
    msg: M,
  ) -> Result<(), ClusterError>
  where
    M: Serialize + Send + 'static,
  {
    if self.core.drain.is_pulsed() {
      return Err(ClusterError::Draining);
    }
    if dst.peer == self.core.us {
      match self.core.mailboxes.get(dst.mailbox) {
        Some(recvr) => {
          tokio::spawn(async move { recvr(Delivery::Local(Box::new(msg))) });
          Ok(())
        }
        None => {
          warn!(
            LOG_LEVEL,
            self.core.logger,
            format!("dropping a send to unknown local mailbox {}", dst.mailbox)
          );
          Err(ClusterError::UnknownMailbox(dst.mailbox))
        }
      }
    } else {
      let peer = match self.core.membership.get(dst.peer) {
        Some(p) => p,
        None => {
          warn!(
            LOG_LEVEL,
            self.core.logger,
            format!("dropping a send to unknown peer {}", dst.peer)
          );
          return Err(ClusterError::UnknownPeer(dst.peer));
        }
      };
      if peer.state() != PeerState::Connected {
        warn!(
          LOG_LEVEL,
          self.core.logger,
          format!(
            "dropping a send to peer {} in state {:?}",
            dst.peer,
            peer.state()
          )
        );
        return Err(ClusterError::NotConnected(dst.peer));
      }
      let payload = serialize(&msg)?;
      if payload.len() as u64 > crate::core::MAX_FRAME_LEN as u64 {
        return Err(ClusterError::Framing("payload length exceeds the cap"));
      }
      let header = WireMsg::MailboxMsg {
        id: dst.mailbox,
        length: payload.len() as u64,
        type_name: if cfg!(debug_assertions) {
          Some(std::any::type_name::<M>().to_string())
        } else {
          None
        },
      };
      peer.write_with_payload(&header, &payload[..]).await
    }
  }

  /// Evicts a peer: propose the kill to every connected member, and once
  /// all accept, make it official. Idempotent while another task is already
  /// evicting the same peer.
  pub async fn kill_peer(&self, id: PeerId) -> Result<(), ClusterError> {
    if self.core.drain.is_pulsed() {
      return Err(ClusterError::Draining);
    }
    let target = self
      .core
      .membership
      .get(id)
      .ok_or(ClusterError::UnknownPeer(id))?;
    if target.state() != PeerState::Connected {
      // someone has beaten us to it
      return Ok(());
    }
    target.set_state(PeerState::KillProposed);
    let addr = target.addr();
    info!(
      LOG_LEVEL,
      self.core.logger,
      format!("proposing the kill of peer {}", addr)
    );

    let (tx, mut rx) = unbounded_channel();
    let srvc: Arc<dyn MsgService> = Arc::new(KillRespondSrvc::new(tx));
    let propose = WireMsg::KillPropose { addr: addr };
    let mut expected = 0;
    for peer in self.core.membership.snapshot() {
      if peer.state() != PeerState::Connected {
        continue;
      }
      peer.add_srvc(srvc.clone());
      match peer.write(&propose).await {
        Ok(()) => expected += 1,
        Err(_) => peer.remove_srvc(&srvc),
      }
    }

    if !self.collect_votes(&mut rx, expected).await? {
      error!(
        LOG_LEVEL,
        self.core.logger,
        format!("a peer refused the kill of {}", addr)
      );
      return Err(ClusterError::Protocol(format!(
        "kill of peer {} was refused",
        id
      )));
    }

    self.finish_kill(&target).await;
    let official = WireMsg::KillMkOfficial { addr: addr };
    for peer in self.core.membership.snapshot() {
      if peer.state() == PeerState::Connected {
        if let Err(e) = peer.write(&official).await {
          warn!(
            LOG_LEVEL,
            self.core.logger,
            format!("could not tell peer {} about the kill: {}", peer.id(), e)
          );
        }
      }
    }
    self.log_peers();
    Ok(())
  }

  /// The `killed` transition: close the connection, drop services, keep the
  /// record as a tombstone.
  pub(crate) async fn finish_kill(&self, target: &Arc<Peer>) {
    if target.state() == PeerState::Killed {
      return;
    }
    target.set_state(PeerState::Killed);
    target.close().await;
    target.shed_services();
    self.core.membership.pulse_peer_join(target.id());
    self.notify(ClusterEvent::PeerKilled(target.addr()));
    info!(
      LOG_LEVEL,
      self.core.logger,
      format!("peer {} is killed", target.addr())
    );
  }

  /// Stops accepting, drains every service loop, then closes peer
  /// connections. Tasks treat the drain as terminal: nothing is sent and no
  /// eviction is started after it fires.
  pub async fn shutdown(&self) {
    info!(LOG_LEVEL, self.core.logger, "draining the cluster");
    self.core.drain.pulse();
    for peer in self.core.membership.snapshot() {
      if peer.state() == PeerState::Connected {
        peer.close().await;
      }
    }
  }

  fn spawn_accept_loop(&self, listener: TcpListener) {
    let core = self.core.clone();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = core.drain.wait() => return,
          res = listener.accept() => match res {
            Ok((stream, _)) => {
              let cluster = Cluster { core: core.clone() };
              tokio::spawn(async move { cluster.handle_accept(stream).await });
            }
            Err(e) => {
              warn!(LOG_LEVEL, core.logger, format!("accept failed: {}", e));
            }
          }
        }
      }
    });
  }

  async fn handle_accept(&self, mut stream: TcpStream) {
    let initial = match read_msg(&mut stream).await {
      Ok(WireMsg::JoinInitial { addr }) => addr,
      Ok(other) => {
        info!(
          LOG_LEVEL,
          self.core.logger,
          format!("peer connected leading with {:?}", other.kind())
        );
        return;
      }
      Err(_) => {
        info!(
          LOG_LEVEL,
          self.core.logger,
          "peer connected and did not send a valid first frame"
        );
        return;
      }
    };
    let result = if initial.id == UNASSIGNED {
      self.handle_unknown_peer(stream, initial).await
    } else {
      self.handle_known_peer(stream, initial).await
    };
    if let Err(e) = result {
      warn!(
        LOG_LEVEL,
        self.core.logger,
        format!("handshake with {} failed: {}", initial, e)
      );
    }
  }

  /// An already-admitted peer (it knows its id) opened its connection to
  /// us: adopt it, echo the initial frame, and start servicing.
  async fn handle_known_peer(
    &self,
    stream: TcpStream,
    addr: AddrInfo,
  ) -> Result<(), ClusterError> {
    let peer = self
      .core
      .membership
      .get(addr.id)
      .ok_or(ClusterError::UnknownPeer(addr.id))?;
    if peer.state() != PeerState::JoinOfficial {
      return Err(ClusterError::Protocol(format!(
        "peer {} connected in state {:?} before being made official",
        addr,
        peer.state()
      )));
    }
    let reader = peer.adopt(stream).await;
    peer.write(&WireMsg::JoinInitial { addr: addr }).await?;
    peer.set_state(PeerState::Connected);
    self.core.membership.pulse_peer_join(addr.id);
    self.notify(ClusterEvent::PeerJoined(addr));
    info!(
      LOG_LEVEL,
      self.core.logger,
      format!("peer {} is connected", addr)
    );
    self.log_peers();
    self.start_main_srvcs(peer, reader);
    Ok(())
  }

  /// An unknown peer asked to join: run the admission protocol on its
  /// behalf, then welcome it and serve the delegate introduction.
  async fn handle_unknown_peer(
    &self,
    mut stream: TcpStream,
    joining: AddrInfo,
  ) -> Result<(), ClusterError> {
    info!(
      LOG_LEVEL,
      self.core.logger,
      format!("admitting a new peer from {}:{}", joining.ipv4(), joining.port)
    );
    let mut candidate = self.core.membership.allocate_candidate(joining);
    self.log_peers();
    loop {
      let (tx, mut rx) = unbounded_channel();
      let srvc: Arc<dyn MsgService> = Arc::new(JoinRespondSrvc::new(tx));
      let propose = WireMsg::JoinPropose {
        addr: candidate.addr(),
      };
      let expected = self.round_trip(candidate.id(), &srvc, &propose).await?;
      if self.collect_votes(&mut rx, expected).await? {
        break;
      }
      // id collision: another admission won this id somewhere else
      debug!(
        LOG_LEVEL,
        self.core.logger,
        format!("candidate id {} collided, advancing", candidate.id())
      );
      candidate = self.core.membership.reallocate(&candidate);
    }

    candidate.set_state(PeerState::JoinOfficial);
    self.log_peers();

    let (tx, mut rx) = unbounded_channel();
    let srvc: Arc<dyn MsgService> = Arc::new(JoinAckOfficialSrvc::new(tx));
    let official = WireMsg::JoinMkOfficial {
      addr: candidate.addr(),
    };
    let expected = self.round_trip(candidate.id(), &srvc, &official).await?;
    self.collect_votes(&mut rx, expected).await?;

    let peers = self.welcome_list(candidate.id()).await?;
    write_msg(
      &mut stream,
      &WireMsg::JoinWelcome {
        assigned: candidate.addr(),
        peers: peers,
      },
    )
    .await?;

    let intro = match self.core.delegate.get() {
      Some(d) => d.introduction(),
      None => Vec::new(),
    };
    write_msg(
      &mut stream,
      &WireMsg::IntroMsg {
        length: intro.len() as u64,
      },
    )
    .await?;
    stream
      .write_all(&intro[..])
      .await
      .map_err(|_| ClusterError::TransportClosed)?;
    info!(
      LOG_LEVEL,
      self.core.logger,
      format!("welcomed {}", candidate.addr())
    );
    Ok(())
  }

  /// Registers a one-shot collector on every voter below `below` and writes
  /// `msg` to each, waiting out records still in join-flight. Returns how
  /// many replies to expect.
  async fn round_trip(
    &self,
    below: PeerId,
    srvc: &Arc<dyn MsgService>,
    msg: &WireMsg,
  ) -> Result<usize, ClusterError> {
    let mut expected = 0;
    for id in self.core.membership.ids_below(below) {
      if id == self.core.us {
        continue;
      }
      let peer = match self.core.membership.get(id) {
        Some(p) => p,
        None => continue,
      };
      match peer.state() {
        PeerState::KillProposed | PeerState::Killed | PeerState::Us => continue,
        PeerState::JoinProposed | PeerState::JoinOfficial => {
          self.wait_for_join(id).await?;
        }
        PeerState::Connected => {}
      }
      // the record can settle differently (or vanish) while we wait
      let peer = match self.core.membership.get(id) {
        Some(p) => p,
        None => continue,
      };
      if peer.state() != PeerState::Connected {
        continue;
      }
      peer.add_srvc(srvc.clone());
      match peer.write(msg).await {
        Ok(()) => expected += 1,
        Err(e) => {
          warn!(
            LOG_LEVEL,
            self.core.logger,
            format!("could not reach peer {} for a round: {}", id, e)
          );
          peer.remove_srvc(srvc);
        }
      }
    }
    Ok(expected)
  }

  async fn collect_votes(
    &self,
    rx: &mut UnboundedReceiver<bool>,
    mut expected: usize,
  ) -> Result<bool, ClusterError> {
    let mut all = true;
    while expected > 0 {
      tokio::select! {
        _ = self.core.drain.wait() => return Err(ClusterError::Draining),
        vote = rx.recv() => match vote {
          Some(v) => {
            all &= v;
            expected -= 1;
          }
          None => {
            return Err(ClusterError::Protocol(
              "a protocol round lost its collectors".to_string(),
            ))
          }
        }
      }
    }
    Ok(all)
  }

  async fn wait_for_join(&self, id: PeerId) -> Result<(), ClusterError> {
    tokio::select! {
      _ = self.core.drain.wait() => Err(ClusterError::Draining),
      _ = self.core.membership.wait_on_peer_join(id) => Ok(()),
    }
  }

  /// The membership below the new id as the welcome will report it, waiting
  /// out in-flight admissions so the joiner never learns of a peer it could
  /// not reach.
  async fn welcome_list(
    &self,
    below: PeerId,
  ) -> Result<Vec<WelcomePeer>, ClusterError> {
    let mut list = Vec::new();
    for id in 0..below {
      match self.core.membership.get(id) {
        None => {
          warn!(
            LOG_LEVEL,
            self.core.logger,
            format!("welcome skips id {}: no record claims it", id)
          );
          continue;
        }
        Some(p) => {
          if matches!(
            p.state(),
            PeerState::JoinProposed | PeerState::JoinOfficial
          ) {
            self.wait_for_join(id).await?;
          }
        }
      }
      let peer = match self.core.membership.get(id) {
        Some(p) => p,
        None => continue,
      };
      let state = if peer.state() == PeerState::Killed {
        Liveness::Killed
      } else {
        Liveness::Live
      };
      list.push(WelcomePeer {
        addr: peer.addr(),
        state: state,
      });
    }
    Ok(list)
  }

  /// Attaches the built-in services (and any user services) to a freshly
  /// connected peer and spawns its serve loop.
  fn start_main_srvcs(&self, peer: Arc<Peer>, reader: OwnedReadHalf) {
    peer.add_srvc(Arc::new(JoinProposeSrvc));
    peer.add_srvc(Arc::new(JoinMkOfficialSrvc));
    peer.add_srvc(Arc::new(KillProposeSrvc));
    peer.add_srvc(Arc::new(KillMkOfficialSrvc));
    peer.add_srvc(Arc::new(MailboxDeliverSrvc));
    for srvc in self.core.added_srvcs.lock().unwrap().iter() {
      peer.add_srvc(srvc.clone());
    }
    let cluster = self.clone();
    tokio::spawn(async move { cluster.serve_peer(peer, reader).await });
  }

  /// Reads frames and dispatches them to this peer's services until the
  /// connection ends, then evicts the peer.
  async fn serve_peer(&self, peer: Arc<Peer>, mut reader: OwnedReadHalf) {
    loop {
      tokio::select! {
        _ = self.core.drain.wait() => return,
        _ = peer.downed.wait() => break,
        res = read_msg(&mut reader) => match res {
          Ok(msg) => {
            let kind = msg.kind();
            match peer.srvc_for(kind) {
              Some(srvc) => {
                let one_shot = srvc.one_shot();
                let outcome = srvc.handle(self, &peer, msg, &mut reader).await;
                if one_shot {
                  peer.remove_srvc(&srvc);
                }
                if let Err(e) = outcome {
                  warn!(
                    LOG_LEVEL,
                    self.core.logger,
                    format!("servicing {:?} from peer {} failed: {}", kind, peer.id(), e)
                  );
                  break;
                }
              }
              None => warn!(
                LOG_LEVEL,
                self.core.logger,
                format!("no service accepts {:?} from peer {}", kind, peer.id())
              ),
            }
          }
          Err(e) => {
            info!(
              LOG_LEVEL,
              self.core.logger,
              format!("connection to peer {} ended: {}", peer.id(), e)
            );
            break;
          }
        }
      }
    }
    peer.shed_services();
    if !self.core.drain.is_pulsed() {
      if let Err(e) = self.kill_peer(peer.id()).await {
        warn!(
          LOG_LEVEL,
          self.core.logger,
          format!("eviction of peer {} failed: {}", peer.id(), e)
        );
      }
    }
  }

  fn log_peers(&self) {
    trace!(
      LOG_LEVEL,
      self.core.logger,
      format!(
        "membership: [{}]",
        self
          .core
          .membership
          .snapshot()
          .iter()
          .map(|p| format!("{}={:?}", p.id(), p.state()))
          .join(", ")
      )
    );
  }
}

use crate::cluster::{Peer, PeerState};
use crate::core::{AddrInfo, PeerId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// The authoritative map of known peers. Each id maps to exactly one record;
/// ids are dense while no admission has been superseded, and are never
/// reused. Exactly one record carries [`PeerState::Us`].
pub(crate) struct Membership {
  us: PeerId,
  peers: Mutex<BTreeMap<PeerId, Arc<Peer>>>,
  /// Bumped whenever a record reaches a settled state; join waiters
  /// re-check on every bump.
  version: watch::Sender<u64>,
}
impl Membership {
  pub fn new(our_addr: AddrInfo) -> Membership {
    let (version, _) = watch::channel(0);
    let m = Membership {
      us: our_addr.id,
      peers: Mutex::new(BTreeMap::new()),
      version: version,
    };
    m.insert(Peer::new(our_addr, PeerState::Us));
    m
  }

  pub fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
    self.peers.lock().unwrap().get(&id).cloned()
  }

  pub fn insert(&self, peer: Arc<Peer>) {
    self.peers.lock().unwrap().insert(peer.id(), peer);
  }

  pub fn snapshot(&self) -> Vec<Arc<Peer>> {
    self.peers.lock().unwrap().values().cloned().collect()
  }

  /// Ids of existing records strictly below `id`, in order.
  pub fn ids_below(&self, id: PeerId) -> Vec<PeerId> {
    self
      .peers
      .lock()
      .unwrap()
      .range(..id)
      .map(|(k, _)| *k)
      .collect()
  }

  /// Picks the next candidate id and inserts its proposed record in one
  /// step, so two overlapping admissions on this node can never choose the
  /// same id.
  pub fn allocate_candidate(&self, endpoint: AddrInfo) -> Arc<Peer> {
    let mut peers = self.peers.lock().unwrap();
    let id = peers.keys().next_back().copied().unwrap_or(self.us) + 1;
    let peer = Peer::new(endpoint.with_id(id), PeerState::JoinProposed);
    peers.insert(id, peer.clone());
    peer
  }

  /// After a rejected round: drop the rejected placeholder and allocate the
  /// next candidate for the same endpoint.
  pub fn reallocate(&self, rejected: &Arc<Peer>) -> Arc<Peer> {
    let mut peers = self.peers.lock().unwrap();
    peers.remove(&rejected.id());
    let high_water = peers
      .keys()
      .next_back()
      .copied()
      .unwrap_or(self.us)
      .max(rejected.id());
    let id = high_water + 1;
    let peer = Peer::new(rejected.addr().with_id(id), PeerState::JoinProposed);
    peers.insert(id, peer.clone());
    peer
  }

  /// The vote on an incoming proposal: accept iff no record holds the id.
  /// A `JoinProposed` record for the same endpoint under a different id is
  /// a superseded round of the same admission and is dropped first.
  pub fn try_admit(&self, addr: AddrInfo) -> bool {
    let mut peers = self.peers.lock().unwrap();
    peers.retain(|id, p| {
      *id == addr.id
        || p.state() != PeerState::JoinProposed
        || !p.addr().same_endpoint(&addr)
    });
    if peers.contains_key(&addr.id) {
      return false;
    }
    peers.insert(addr.id, Peer::new(addr, PeerState::JoinProposed));
    true
  }

  /// An admission became official. Upserts so this node converges even when
  /// it never saw (or rejected) the winning proposal.
  pub fn make_official(&self, addr: AddrInfo) -> Arc<Peer> {
    let mut peers = self.peers.lock().unwrap();
    if let Some(p) = peers.get(&addr.id) {
      if p.addr().same_endpoint(&addr) {
        if p.state() < PeerState::JoinOfficial {
          p.set_state(PeerState::JoinOfficial);
        }
        return p.clone();
      }
    }
    let peer = Peer::new(addr, PeerState::JoinOfficial);
    peers.insert(addr.id, peer.clone());
    peer
  }

  fn join_ready(&self, id: PeerId) -> bool {
    match self.get(id) {
      Some(p) => matches!(
        p.state(),
        PeerState::Connected | PeerState::Us | PeerState::Killed
      ),
      None => false,
    }
  }

  /// Resolves once the record for `id` is connected, local or killed.
  pub async fn wait_on_peer_join(&self, id: PeerId) {
    let mut rx = self.version.subscribe();
    loop {
      if self.join_ready(id) {
        return;
      }
      if rx.changed().await.is_err() {
        return;
      }
    }
  }

  /// Wakes every join waiter to re-check.
  pub fn pulse_peer_join(&self, _id: PeerId) {
    self.version.send_modify(|v| *v += 1);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use itertools::Itertools;
  use std::net::Ipv4Addr;

  fn addr(n: u8, id: PeerId) -> AddrInfo {
    AddrInfo::new(Ipv4Addr::new(10, 0, 0, n), 17010, id)
  }

  fn founder() -> Membership {
    Membership::new(addr(1, 0))
  }

  #[test]
  fn candidates_count_up_and_never_collide_locally() {
    let m = founder();
    let a = m.allocate_candidate(addr(2, -1));
    let b = m.allocate_candidate(addr(3, -1));
    assert_eq!((a.id(), b.id()), (1, 2));
    assert_eq!(m.ids_below(3), vec![0, 1, 2]);
  }

  #[test]
  fn occupied_ids_reject_proposals() {
    let m = founder();
    assert!(m.try_admit(addr(2, 1)));
    // a different endpoint proposing the same id collides
    assert!(!m.try_admit(addr(3, 1)));
    // the loser retries one id up and is admitted
    assert!(m.try_admit(addr(3, 2)));
    let ids = m.snapshot().iter().map(|p| p.id()).sorted().collect_vec();
    assert_eq!(ids, vec![0, 1, 2]);
  }

  #[test]
  fn a_retry_supersedes_the_placeholder_of_its_own_earlier_round() {
    let m = founder();
    assert!(m.try_admit(addr(2, 1)));
    // the same endpoint comes back one id up: the old placeholder goes away
    assert!(m.try_admit(addr(2, 2)));
    assert!(m.get(1).is_none());
    assert_eq!(m.get(2).unwrap().addr().ip, addr(2, 2).ip);
  }

  #[test]
  fn rejected_rounds_advance_the_candidate_without_reusing_ids() {
    let m = founder();
    let first = m.allocate_candidate(addr(2, -1));
    assert_eq!(first.id(), 1);
    let second = m.reallocate(&first);
    assert_eq!(second.id(), 2);
    assert!(m.get(1).is_none());
    // an unrelated admission never dips below the high-water mark
    assert_eq!(m.allocate_candidate(addr(4, -1)).id(), 3);
  }

  #[test]
  fn make_official_converges_nodes_that_rejected_the_winner() {
    let m = founder();
    // this node rejected the winning proposal, so it has no record at 1
    let p = m.make_official(addr(2, 1));
    assert_eq!(p.state(), PeerState::JoinOfficial);
    // and an accepted proposal just moves forward
    assert!(m.try_admit(addr(3, 2)));
    assert_eq!(
      m.make_official(addr(3, 2)).state(),
      PeerState::JoinOfficial
    );
  }

  #[tokio::test]
  async fn join_waiters_wake_on_settled_records() {
    let m = Arc::new(founder());
    assert!(m.try_admit(addr(2, 1)));
    let waiter = {
      let m = m.clone();
      tokio::spawn(async move { m.wait_on_peer_join(1).await })
    };
    let p = m.get(1).unwrap();
    p.set_state(PeerState::Connected);
    m.pulse_peer_join(1);
    waiter.await.unwrap();
    // settled records resolve immediately
    m.wait_on_peer_join(0).await;
  }
}

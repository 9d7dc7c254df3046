use conclave::cluster::{
  Cluster, ClusterConfig, ClusterEvent, Delegate, PeerState,
};
use conclave::core::{ClusterAddress, ClusterError, Host, IntroPipe};
use conclave::testkit::LogLevel;
use std::sync::Arc;
use std::time::Duration;

fn config() -> ClusterConfig {
  ClusterConfig {
    log_level: LogLevel::Off,
    ..ClusterConfig::default()
  }
}

struct Empty;
impl Delegate for Empty {
  fn introduction(&self) -> Vec<u8> {
    Vec::new()
  }
}

async fn join(port: u16) -> Cluster {
  Cluster::join(
    config(),
    Host::from("127.0.0.1".to_string()),
    port,
    |mut pipe: IntroPipe| async move {
      pipe.read_to_end().await?;
      Ok(Arc::new(Empty) as Arc<dyn Delegate>)
    },
  )
  .await
  .unwrap()
}

async fn let_stuff_happen() {
  tokio::time::sleep(Duration::from_millis(500)).await;
}

fn state_of(cluster: &Cluster, id: i64) -> PeerState {
  cluster
    .peers()
    .iter()
    .find(|(a, _)| a.id == id)
    .map(|(_, s)| *s)
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn a_dead_peer_is_evicted_by_the_survivors() {
  let a = Cluster::start(config(), Arc::new(Empty)).await.unwrap();
  let b = join(a.addr().port).await;
  let c = join(a.addr().port).await;
  let_stuff_happen().await;

  let mut a_events = a.subscribe();
  let b_id = b.us();
  b.shutdown().await;
  let_stuff_happen().await;

  // both survivors hold the tombstone
  assert_eq!(state_of(&a, b_id), PeerState::Killed);
  assert_eq!(state_of(&c, b_id), PeerState::Killed);
  // the id stays taken
  assert!(a.peers().iter().any(|(addr, _)| addr.id == b_id));

  match a_events.recv().await {
    Some(ClusterEvent::PeerKilled(addr)) => assert_eq!(addr.id, b_id),
    other => panic!("expected PeerKilled, got {:?}", other),
  }

  // sends to the tombstone are dropped with an error
  match a
    .send(
      ClusterAddress {
        peer: b_id,
        mailbox: 0,
      },
      "too late".to_string(),
    )
    .await
  {
    Err(ClusterError::NotConnected(id)) => assert_eq!(id, b_id),
    other => panic!("expected NotConnected, got {:?}", other),
  }

  a.shutdown().await;
  c.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_kills_are_permanent_and_idempotent() {
  let a = Cluster::start(config(), Arc::new(Empty)).await.unwrap();
  let b = join(a.addr().port).await;
  let_stuff_happen().await;

  a.kill_peer(b.us()).await.unwrap();
  assert_eq!(state_of(&a, b.us()), PeerState::Killed);
  // killing a tombstone is a no-op
  a.kill_peer(b.us()).await.unwrap();
  assert_eq!(state_of(&a, b.us()), PeerState::Killed);

  match a
    .send(
      ClusterAddress {
        peer: b.us(),
        mailbox: 0,
      },
      "too late".to_string(),
    )
    .await
  {
    Err(ClusterError::NotConnected(_)) => {}
    other => panic!("expected NotConnected, got {:?}", other),
  }

  a.shutdown().await;
  b.shutdown().await;
}

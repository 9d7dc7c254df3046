use conclave::cluster::{Cluster, ClusterConfig, Delegate, PeerState};
use conclave::core::{ClusterAddress, ClusterError, Host, IntroPipe};
use conclave::testkit::LogLevel;
use itertools::Itertools;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;

const INTRO: &[u8] = b"tables: users, posts";

fn config() -> ClusterConfig {
  ClusterConfig {
    log_level: LogLevel::Off,
    ..ClusterConfig::default()
  }
}

struct Catalog;
impl Delegate for Catalog {
  fn introduction(&self) -> Vec<u8> {
    INTRO.to_vec()
  }
}

async fn let_stuff_happen() {
  tokio::time::sleep(Duration::from_millis(300)).await;
}

fn ids_and_states(cluster: &Cluster) -> Vec<(i64, PeerState)> {
  cluster
    .peers()
    .iter()
    .map(|(a, s)| (a.id, *s))
    .sorted()
    .collect_vec()
}

#[tokio::test(flavor = "multi_thread")]
async fn founder_welcomes_a_joiner_with_the_introduction() {
  let founder = Cluster::start(config(), Arc::new(Catalog)).await.unwrap();
  let joiner = Cluster::join(
    config(),
    Host::from("127.0.0.1".to_string()),
    founder.addr().port,
    |mut pipe: IntroPipe| async move {
      assert_eq!(pipe.remaining(), INTRO.len() as u64);
      let bytes = pipe.read_to_end().await?;
      assert_eq!(&bytes[..], INTRO);
      Ok(Arc::new(Catalog) as Arc<dyn Delegate>)
    },
  )
  .await
  .unwrap();
  let_stuff_happen().await;

  assert_eq!(founder.us(), 0);
  assert_eq!(joiner.us(), 1);
  assert_eq!(
    ids_and_states(&founder),
    vec![(0, PeerState::Us), (1, PeerState::Connected)]
  );
  assert_eq!(
    ids_and_states(&joiner),
    vec![(0, PeerState::Connected), (1, PeerState::Us)]
  );

  founder.shutdown().await;
  joiner.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn local_sends_short_circuit() {
  let founder = Cluster::start(config(), Arc::new(Catalog)).await.unwrap();
  let joiner = Cluster::join(
    config(),
    Host::from("127.0.0.1".to_string()),
    founder.addr().port,
    |mut pipe: IntroPipe| async move {
      pipe.read_to_end().await?;
      Ok(Arc::new(Catalog) as Arc<dyn Delegate>)
    },
  )
  .await
  .unwrap();

  let (tx, mut rx) = unbounded_channel();
  let mbox = joiner.open_mailbox(move |s: String| {
    tx.send(s).unwrap();
  });
  assert_eq!(mbox.address().peer, joiner.us());
  joiner.send(mbox.address(), "hi".to_string()).await.unwrap();
  assert_eq!(rx.recv().await.unwrap(), "hi");

  founder.shutdown().await;
  joiner.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_sends_reach_the_handler_once() {
  let founder = Cluster::start(config(), Arc::new(Catalog)).await.unwrap();
  let joiner = Cluster::join(
    config(),
    Host::from("127.0.0.1".to_string()),
    founder.addr().port,
    |mut pipe: IntroPipe| async move {
      pipe.read_to_end().await?;
      Ok(Arc::new(Catalog) as Arc<dyn Delegate>)
    },
  )
  .await
  .unwrap();

  let (tx, mut rx) = unbounded_channel();
  let mbox = joiner.open_mailbox(move |s: String| {
    tx.send(s).unwrap();
  });
  founder.send(mbox.address(), "hi".to_string()).await.unwrap();
  assert_eq!(rx.recv().await.unwrap(), "hi");
  let_stuff_happen().await;
  assert!(rx.try_recv().is_err());

  founder.shutdown().await;
  joiner.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_mailboxes_drop_without_desyncing_the_stream() {
  let founder = Cluster::start(config(), Arc::new(Catalog)).await.unwrap();
  let joiner = Cluster::join(
    config(),
    Host::from("127.0.0.1".to_string()),
    founder.addr().port,
    |mut pipe: IntroPipe| async move {
      pipe.read_to_end().await?;
      Ok(Arc::new(Catalog) as Arc<dyn Delegate>)
    },
  )
  .await
  .unwrap();

  // a local miss is reported to the sender
  match founder
    .send(
      ClusterAddress {
        peer: founder.us(),
        mailbox: 999,
      },
      "void".to_string(),
    )
    .await
  {
    Err(ClusterError::UnknownMailbox(999)) => {}
    other => panic!("expected UnknownMailbox, got {:?}", other),
  }

  // a remote miss is consumed by the receiver; the connection stays usable
  founder
    .send(
      ClusterAddress {
        peer: joiner.us(),
        mailbox: 999,
      },
      "void".to_string(),
    )
    .await
    .unwrap();

  let (tx, mut rx) = unbounded_channel();
  let mbox = joiner.open_mailbox(move |s: String| {
    tx.send(s).unwrap();
  });
  founder.send(mbox.address(), "still here".to_string()).await.unwrap();
  assert_eq!(rx.recv().await.unwrap(), "still here");

  founder.shutdown().await;
  joiner.shutdown().await;
}

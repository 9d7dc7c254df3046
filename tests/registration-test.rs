use conclave::cluster::{
  Cluster, ClusterConfig, Delegate, Directory, RegistrarCard, Registrant,
  Registrar, RegistrationController, RegistrationId,
};
use conclave::testkit::LogLevel;
use std::sync::{Arc, Mutex};
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

async fn let_stuff_happen() {
  tokio::time::sleep(Duration::from_millis(300)).await;
}

/// Mirrors the monitoring controller of the original test: tracks whether a
/// registrant is present and what it registered with.
struct Monitoring {
  registrant: Mutex<Option<String>>,
}
impl Monitoring {
  fn new() -> Arc<Monitoring> {
    Arc::new(Monitoring {
      registrant: Mutex::new(None),
    })
  }

  fn data(&self) -> Option<String> {
    self.registrant.lock().unwrap().clone()
  }
}
impl RegistrationController for Monitoring {
  type Data = String;

  fn on_register(&self, _id: RegistrationId, data: String) {
    let mut slot = self.registrant.lock().unwrap();
    assert!(slot.is_none());
    *slot = Some(data);
  }

  fn on_deregister(&self, _id: RegistrationId) {
    let mut slot = self.registrant.lock().unwrap();
    assert!(slot.is_some());
    *slot = None;
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn register_then_deregister() {
  let cluster = Cluster::start(config(), Arc::new(Empty)).await.unwrap();
  let controller = Monitoring::new();
  let registrar = Registrar::new(&cluster, controller.clone());

  let directory: Directory<RegistrarCard> = Directory::new();
  directory.publish(registrar.card());

  assert_eq!(controller.data(), None);
  {
    let registrant =
      Registrant::new(&cluster, directory.view(), "hello".to_string())
        .await
        .unwrap();
    let_stuff_happen().await;

    assert!(!registrant.failed_signal().is_pulsed());
    assert_eq!(controller.data(), Some("hello".to_string()));
  }
  let_stuff_happen().await;

  assert_eq!(controller.data(), None);
  cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn registrar_death_pulses_the_failed_signal() {
  let cluster = Cluster::start(config(), Arc::new(Empty)).await.unwrap();
  let controller = Monitoring::new();
  let registrar = Registrar::new(&cluster, controller.clone());

  let directory: Directory<RegistrarCard> = Directory::new();
  directory.publish(registrar.card());

  let registrant =
    Registrant::new(&cluster, directory.view(), "hello".to_string())
      .await
      .unwrap();
  let_stuff_happen().await;

  assert!(!registrant.failed_signal().is_pulsed());
  assert_eq!(controller.data(), Some("hello".to_string()));

  // kill the registrar
  directory.unpublish();
  drop(registrar);
  let_stuff_happen().await;

  assert!(registrant.failed_signal().is_pulsed());
  assert_eq!(controller.data(), None);
  cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn registering_without_a_published_card_fails() {
  let cluster = Cluster::start(config(), Arc::new(Empty)).await.unwrap();
  let directory: Directory<RegistrarCard> = Directory::new();
  assert!(
    Registrant::new(&cluster, directory.view(), "hello".to_string())
      .await
      .is_err()
  );
  cluster.shutdown().await;
}

use crate::cluster::{Cluster, ClusterEvent};
use crate::core::{ClusterAddress, ClusterError, Mailbox, PeerId, Pulse};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Uniquely names one registration: the registrant's peer id plus a
/// process-local serial.
#[derive(
  Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct RegistrationId {
  pub peer: PeerId,
  pub serial: u64,
}

/// How a registrar is found: the addresses of its create and delete
/// mailboxes, typically published in a [`Directory`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegistrarCard {
  pub create: ClusterAddress,
  pub delete: ClusterAddress,
}

#[derive(Deserialize, Serialize)]
struct CreateReq<T> {
  id: RegistrationId,
  data: T,
}

#[derive(Deserialize, Serialize)]
struct DeleteReq {
  id: RegistrationId,
}

/// The application side of a [`Registrar`]: told when registrants appear
/// and disappear.
pub trait RegistrationController: Send + Sync + 'static {
  type Data: Serialize + DeserializeOwned + Send + 'static;
  fn on_register(&self, id: RegistrationId, data: Self::Data);
  fn on_deregister(&self, id: RegistrationId);
}

/// Accepts registrations over two mailboxes. Dropping the registrar closes
/// the mailboxes and deregisters every remaining registrant with the
/// controller.
pub struct Registrar<C: RegistrationController> {
  controller: Arc<C>,
  active: Arc<Mutex<HashSet<RegistrationId>>>,
  create_mbox: Mailbox<CreateReq<C::Data>>,
  delete_mbox: Mailbox<DeleteReq>,
}
impl<C: RegistrationController> Registrar<C> {
  pub fn new(cluster: &Cluster, controller: Arc<C>) -> Registrar<C> {
    let active = Arc::new(Mutex::new(HashSet::new()));
    let create_mbox = {
      let controller = controller.clone();
      let active = active.clone();
      cluster.open_mailbox(move |req: CreateReq<C::Data>| {
        if active.lock().unwrap().insert(req.id) {
          controller.on_register(req.id, req.data);
        }
      })
    };
    let delete_mbox = {
      let controller = controller.clone();
      let active = active.clone();
      cluster.open_mailbox(move |req: DeleteReq| {
        if active.lock().unwrap().remove(&req.id) {
          controller.on_deregister(req.id);
        }
      })
    };
    Registrar {
      controller: controller,
      active: active,
      create_mbox: create_mbox,
      delete_mbox: delete_mbox,
    }
  }

  /// The card registrants use to reach this registrar.
  pub fn card(&self) -> RegistrarCard {
    RegistrarCard {
      create: self.create_mbox.address(),
      delete: self.delete_mbox.address(),
    }
  }
}
impl<C: RegistrationController> Drop for Registrar<C> {
  fn drop(&mut self) {
    for id in self.active.lock().unwrap().drain() {
      self.controller.on_deregister(id);
    }
  }
}

/// A published optional value, watched by registrants to find (and outlive)
/// their registrar.
pub struct Directory<T> {
  tx: Arc<watch::Sender<Option<T>>>,
}
impl<T: Clone + Send + Sync + 'static> Directory<T> {
  pub fn new() -> Directory<T> {
    let (tx, _) = watch::channel(None);
    Directory { tx: Arc::new(tx) }
  }

  pub fn publish(&self, value: T) {
    self.tx.send_replace(Some(value));
  }

  pub fn unpublish(&self) {
    self.tx.send_replace(None);
  }

  pub fn view(&self) -> watch::Receiver<Option<T>> {
    self.tx.subscribe()
  }
}
impl<T: Clone + Send + Sync + 'static> Default for Directory<T> {
  fn default() -> Self {
    Directory::new()
  }
}

/// One registration with the registrar published in a directory view.
/// `failed_signal` pulses when the registrar goes away: its card is
/// unpublished or replaced, its peer is killed, or the local cluster
/// drains. Dropping a live registrant sends the delete message.
pub struct Registrant {
  id: RegistrationId,
  cluster: Cluster,
  card: RegistrarCard,
  failed: Pulse,
  watcher: JoinHandle<()>,
}
impl Registrant {
  pub async fn new<T>(
    cluster: &Cluster,
    mut view: watch::Receiver<Option<RegistrarCard>>,
    data: T,
  ) -> Result<Registrant, ClusterError>
  where
    T: Serialize + Send + 'static,
  {
    let card = view.borrow_and_update().clone().ok_or_else(|| {
      ClusterError::Protocol("no registrar is published".to_string())
    })?;
    let id = RegistrationId {
      peer: cluster.us(),
      serial: NEXT_SERIAL.fetch_add(1, Ordering::SeqCst),
    };
    cluster.send(card.create, CreateReq { id: id, data: data }).await?;

    let failed = Pulse::new();
    let watcher = {
      let failed = failed.clone();
      let drain = cluster.core.drain.clone();
      let mut events = cluster.subscribe();
      tokio::spawn(async move {
        loop {
          tokio::select! {
            _ = drain.wait() => {
              failed.pulse();
              return;
            }
            changed = view.changed() => {
              let gone = changed.is_err()
                || view
                  .borrow_and_update()
                  .as_ref()
                  .map(|c| *c != card)
                  .unwrap_or(true);
              if gone {
                failed.pulse();
                return;
              }
            }
            event = events.recv() => match event {
              Some(ClusterEvent::PeerKilled(addr)) if addr.id == card.create.peer => {
                failed.pulse();
                return;
              }
              Some(_) => {}
              None => {
                failed.pulse();
                return;
              }
            }
          }
        }
      })
    };

    Ok(Registrant {
      id: id,
      cluster: cluster.clone(),
      card: card,
      failed: failed,
      watcher: watcher,
    })
  }

  pub fn id(&self) -> RegistrationId {
    self.id
  }

  /// Pulses once the registrar can no longer serve this registration.
  pub fn failed_signal(&self) -> &Pulse {
    &self.failed
  }
}
impl Drop for Registrant {
  fn drop(&mut self) {
    self.watcher.abort();
    if !self.failed.is_pulsed() {
      let cluster = self.cluster.clone();
      let delete = self.card.delete;
      let id = self.id;
      tokio::spawn(async move {
        let _ = cluster.send(delete, DeleteReq { id: id }).await;
      });
    }
  }
}

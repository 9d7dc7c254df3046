use crate::core::{deserialize, PeerId};
use crate::testkit::LoggerRef;
use crate::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::core::LOG_LEVEL;

/// Identifies a mailbox within its owning process. Dense, monotone, never
/// recycled for the lifetime of the process.
pub type MailboxId = u64;

/// The global name of a mailbox: which peer it lives on and its local id.
/// This is the unit of addressed sends.
#[derive(
  Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct ClusterAddress {
  pub peer: PeerId,
  pub mailbox: MailboxId,
}

/// What a mailbox receives. Local sends short-circuit with the typed value;
/// remote sends arrive as encoded bytes.
pub(crate) enum Delivery {
  Local(Box<dyn Any + Send>),
  Remote(Vec<u8>),
}

type MailboxRecvr = Arc<dyn Fn(Delivery) + Send + Sync>;

struct MapInner {
  map: HashMap<MailboxId, MailboxRecvr>,
  head: MailboxId,
}

/// The process-local id → handler map. Uniquely owned by the cluster; each
/// [`Mailbox`] holds a shared handle so it can deregister itself on drop.
pub(crate) struct MailboxMap {
  inner: Mutex<MapInner>,
  us: PeerId,
  logger: LoggerRef,
}
impl MailboxMap {
  pub fn new(us: PeerId, logger: LoggerRef) -> Arc<MailboxMap> {
    Arc::new(MailboxMap {
      inner: Mutex::new(MapInner {
        map: HashMap::new(),
        head: 0,
      }),
      us: us,
      logger: logger,
    })
  }

  fn add(&self, recvr: MailboxRecvr) -> MailboxId {
    let mut inner = self.inner.lock().unwrap();
    let id = inner.head;
    inner.head += 1;
    match inner.map.entry(id) {
      Entry::Vacant(v) => {
        v.insert(recvr);
      }
      Entry::Occupied(_) => unreachable!("mailbox ids are never recycled"),
    }
    id
  }

  pub fn get(&self, id: MailboxId) -> Option<MailboxRecvr> {
    self.inner.lock().unwrap().map.get(&id).cloned()
  }

  fn remove(&self, id: MailboxId) {
    self.inner.lock().unwrap().map.remove(&id);
  }
}

/// A process-local addressable endpoint. Creating one registers its handler
/// with the cluster under a fresh id; dropping it deregisters. The handler
/// runs on a fresh task per delivery, never inline with the sender.
pub struct Mailbox<M: 'static> {
  id: MailboxId,
  map: Arc<MailboxMap>,
  _msg: PhantomData<fn(M)>,
}
impl<M: DeserializeOwned + Send + 'static> Mailbox<M> {
  pub(crate) fn attach<F>(map: Arc<MailboxMap>, handler: F) -> Mailbox<M>
  where
    F: Fn(M) + Send + Sync + 'static,
  {
    let logger = map.logger.clone();
    let recvr: MailboxRecvr = Arc::new(move |delivery| match delivery {
      Delivery::Local(any) => match any.downcast::<M>() {
        Ok(msg) => handler(*msg),
        Err(_) => warn!(
          LOG_LEVEL,
          logger,
          "dropping a local delivery of the wrong type"
        ),
      },
      Delivery::Remote(bytes) => match deserialize::<M>(&bytes[..]) {
        Ok(msg) => handler(msg),
        Err(e) => warn!(
          LOG_LEVEL,
          logger,
          format!("dropping an undecodable delivery: {}", e)
        ),
      },
    });
    let id = map.add(recvr);
    Mailbox {
      id: id,
      map: map,
      _msg: PhantomData,
    }
  }

  pub fn id(&self) -> MailboxId {
    self.id
  }

  /// This mailbox's global name.
  pub fn address(&self) -> ClusterAddress {
    ClusterAddress {
      peer: self.map.us,
      mailbox: self.id,
    }
  }
}
impl<M: 'static> Drop for Mailbox<M> {
  fn drop(&mut self) {
    self.map.remove(self.id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testkit::{LogLevel, Logger};
  use std::sync::atomic::{AtomicU64, Ordering};

  fn map() -> Arc<MailboxMap> {
    MailboxMap::new(0, Logger::spawn("test", LogLevel::Off))
  }

  #[tokio::test]
  async fn ids_are_dense_and_never_recycled() {
    let map = map();
    let a = Mailbox::<String>::attach(map.clone(), |_| {});
    let b = Mailbox::<String>::attach(map.clone(), |_| {});
    assert_eq!((a.id(), b.id()), (0, 1));
    drop(a);
    let c = Mailbox::<String>::attach(map.clone(), |_| {});
    assert_eq!(c.id(), 2);
    assert!(map.get(0).is_none());
    assert!(map.get(1).is_some());
  }

  #[tokio::test]
  async fn dropped_mailboxes_deregister() {
    let map = map();
    let hits = Arc::new(AtomicU64::new(0));
    let h = hits.clone();
    let mbox = Mailbox::<u32>::attach(map.clone(), move |_| {
      h.fetch_add(1, Ordering::SeqCst);
    });
    let id = mbox.id();
    map.get(id).unwrap()(Delivery::Local(Box::new(7u32)));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    drop(mbox);
    assert!(map.get(id).is_none());
  }

  #[tokio::test]
  async fn wrong_type_deliveries_are_dropped() {
    let map = map();
    let hits = Arc::new(AtomicU64::new(0));
    let h = hits.clone();
    let mbox = Mailbox::<u32>::attach(map.clone(), move |_| {
      h.fetch_add(1, Ordering::SeqCst);
    });
    map.get(mbox.id()).unwrap()(Delivery::Local(Box::new("nope".to_string())));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
  }
}

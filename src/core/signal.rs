use std::sync::Arc;
use tokio::sync::watch;

/// A one-way, one-shot condition. Starts unpulsed; any number of tasks can
/// wait on it; once pulsed it stays pulsed forever.
///
/// Used for the cluster's drain signal and for registrant failure signals.
#[derive(Clone)]
pub struct Pulse {
  tx: Arc<watch::Sender<bool>>,
}
impl Pulse {
  pub fn new() -> Pulse {
    let (tx, _) = watch::channel(false);
    Pulse { tx: Arc::new(tx) }
  }

  /// Fires the pulse. Idempotent.
  pub fn pulse(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_pulsed(&self) -> bool {
    *self.tx.borrow()
  }

  /// Resolves once the pulse has fired. Returns immediately if it already
  /// has.
  pub async fn wait(&self) {
    let mut rx = self.tx.subscribe();
    while !*rx.borrow_and_update() {
      if rx.changed().await.is_err() {
        return;
      }
    }
  }
}
impl Default for Pulse {
  fn default() -> Self {
    Pulse::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn pulse_wakes_waiters_and_stays_pulsed() {
    let p = Pulse::new();
    assert!(!p.is_pulsed());
    let waiter = {
      let p = p.clone();
      tokio::spawn(async move { p.wait().await })
    };
    p.pulse();
    waiter.await.unwrap();
    assert!(p.is_pulsed());
    p.wait().await;
    p.pulse();
    assert!(p.is_pulsed());
  }
}

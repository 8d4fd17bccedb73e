//! Registry of connected UI clients.
//!
//! Clients subscribe explicitly and stay registered for as long as they hold
//! their `Subscription`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use crate::messages::ClientMessage;

#[derive(Default)]
struct Registry {
  next_id: u64,
  clients: HashMap<u64, mpsc::UnboundedSender<ClientMessage>>,
}

/// Shared handle to the set of subscribed clients.
#[derive(Clone, Default)]
pub struct ClientRegistry {
  inner: Arc<Mutex<Registry>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Registry> {
    // A panic while holding the lock cannot leave the map half-updated
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Register a new client.
  pub fn subscribe(&self) -> Subscription {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut registry = self.lock();
    let id = registry.next_id;
    registry.next_id += 1;
    registry.clients.insert(id, tx);
    debug!(client = id, "Client subscribed");

    Subscription {
      id,
      registry: self.clone(),
      receiver: rx,
    }
  }

  #[cfg(test)]
  pub fn client_count(&self) -> usize {
    self.lock().clients.len()
  }

  /// Queue `message` for every client. Returns how many received it.
  pub fn broadcast(&self, message: &ClientMessage) -> usize {
    let mut registry = self.lock();
    registry
      .clients
      .retain(|_, tx| tx.send(message.clone()).is_ok());
    registry.clients.len()
  }

  fn unregister(&self, id: u64) {
    if self.lock().clients.remove(&id).is_some() {
      debug!(client = id, "Client unsubscribed");
    }
  }
}

/// A registered client. Dropping it unregisters the client.
pub struct Subscription {
  id: u64,
  registry: ClientRegistry,
  receiver: mpsc::UnboundedReceiver<ClientMessage>,
}

impl Subscription {
  #[cfg(test)]
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Wait for the next message.
  #[cfg(test)]
  pub async fn recv(&mut self) -> Option<ClientMessage> {
    self.receiver.recv().await
  }

  /// Next message if one is already queued.
  pub fn try_recv(&mut self) -> Option<ClientMessage> {
    self.receiver.try_recv().ok()
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.registry.unregister(self.id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::messages::LessonOutcome;

  #[tokio::test]
  async fn test_broadcast_reaches_all_clients() {
    let registry = ClientRegistry::new();
    let mut a = registry.subscribe();
    let mut b = registry.subscribe();
    assert_ne!(a.id(), b.id());

    let msg = ClientMessage::LessonCached(LessonOutcome::ok("1"));
    assert_eq!(registry.broadcast(&msg), 2);
    assert_eq!(a.recv().await, Some(msg.clone()));
    assert_eq!(b.recv().await, Some(msg));
  }

  #[test]
  fn test_drop_unregisters() {
    let registry = ClientRegistry::new();
    let a = registry.subscribe();
    {
      let _b = registry.subscribe();
      assert_eq!(registry.client_count(), 2);
    }
    assert_eq!(registry.client_count(), 1);
    drop(a);
    assert_eq!(
      registry.broadcast(&ClientMessage::LessonRemoved(LessonOutcome::ok("1"))),
      0
    );
  }

  #[test]
  fn test_try_recv_empty() {
    let registry = ClientRegistry::new();
    let mut a = registry.subscribe();
    assert!(a.try_recv().is_none());
  }
}

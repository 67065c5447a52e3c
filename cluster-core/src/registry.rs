use std::{
  collections::{BTreeSet, HashMap},
  future::Future,
  pin::Pin,
  sync::{Arc, Weak},
  task::{Context, Poll},
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream};
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
  #[error("registry at {address} is unreachable")]
  Unreachable { address: String },

  #[error("registry session expired")]
  SessionExpired,

  #[error("registry connection lost: {0}")]
  Disconnected(String),
}

/// A change to the children of a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
  Created(String),
  Deleted(String),
}

pub type ChildStream = Pin<Box<dyn Stream<Item = Result<ChildEvent, RegistryError>> + Send>>;

/// Snapshot of a path's children plus every change after the snapshot.
///
/// Dropping `updates` releases the subscription.
pub struct ChildWatch {
  pub children: Vec<String>,
  pub updates: ChildStream,
}

pub trait CoordinationRegistry: Send + Sync + 'static {
  fn watch_children(
    &self,
    address: &str,
    path: &str,
  ) -> impl Future<Output = Result<ChildWatch, RegistryError>> + Send;
}

#[derive(Default)]
struct Inner {
  unreachable: bool,
  failing_attempts: usize,
  children: HashMap<String, BTreeSet<String>>,
  subscribers: Vec<Subscriber>,
  next_subscriber: u64,
  watches_opened: usize,
  watches_released: usize,
}

struct Subscriber {
  id: u64,
  path: String,
  sender: mpsc::UnboundedSender<Result<ChildEvent, RegistryError>>,
}

impl Inner {
  fn notify(&mut self, path: &str, event: ChildEvent) {
    self.subscribers.retain(|subscriber| {
      subscriber.path != path || subscriber.sender.send(Ok(event.clone())).is_ok()
    });
  }
}

/// Process-local registry.
///
/// Backs the master's standalone mode and doubles as a controllable
/// registry in tests: it can be made unreachable, fail a number of watch
/// attempts, or drop every live subscription.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
  inner: Arc<Mutex<Inner>>,
}

impl InMemoryRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds `child` under `path`. Returns false if it was already present.
  pub fn register(&self, path: &str, child: &str) -> bool {
    let mut inner = self.inner.lock();
    let inserted = inner
      .children
      .entry(path.to_string())
      .or_default()
      .insert(child.to_string());
    if inserted {
      inner.notify(path, ChildEvent::Created(child.to_string()));
    }
    inserted
  }

  /// Removes `child` from `path`. Returns false if it was not present.
  pub fn deregister(&self, path: &str, child: &str) -> bool {
    let mut inner = self.inner.lock();
    let removed = inner
      .children
      .get_mut(path)
      .map(|children| children.remove(child))
      .unwrap_or(false);
    if removed {
      inner.notify(path, ChildEvent::Deleted(child.to_string()));
    }
    removed
  }

  pub fn children(&self, path: &str) -> Vec<String> {
    self
      .inner
      .lock()
      .children
      .get(path)
      .map(|children| children.iter().cloned().collect())
      .unwrap_or_default()
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.inner.lock().unreachable = !reachable;
  }

  /// Makes the next `attempts` watch requests fail as unreachable.
  pub fn fail_next_watches(&self, attempts: usize) {
    self.inner.lock().failing_attempts = attempts;
  }

  /// Terminates every live subscription with a connection error.
  pub fn disconnect(&self) {
    let subscribers = std::mem::take(&mut self.inner.lock().subscribers);
    debug!(count = subscribers.len(), "Dropping registry subscriptions");
    for subscriber in subscribers {
      let _ = subscriber.sender.send(Err(RegistryError::Disconnected(
        "connection reset by registry".to_string(),
      )));
    }
  }

  pub fn active_watches(&self) -> usize {
    self.inner.lock().subscribers.len()
  }

  pub fn watches_opened(&self) -> usize {
    self.inner.lock().watches_opened
  }

  pub fn watches_released(&self) -> usize {
    self.inner.lock().watches_released
  }
}

impl CoordinationRegistry for InMemoryRegistry {
  async fn watch_children(&self, address: &str, path: &str) -> Result<ChildWatch, RegistryError> {
    let mut inner = self.inner.lock();

    if inner.unreachable || inner.failing_attempts > 0 {
      inner.failing_attempts = inner.failing_attempts.saturating_sub(1);
      return Err(RegistryError::Unreachable {
        address: address.to_string(),
      });
    }

    let (sender, receiver) = mpsc::unbounded_channel();
    let id = inner.next_subscriber;
    inner.next_subscriber += 1;
    inner.watches_opened += 1;
    inner.subscribers.push(Subscriber {
      id,
      path: path.to_string(),
      sender,
    });

    let children = inner
      .children
      .get(path)
      .map(|children| children.iter().cloned().collect())
      .unwrap_or_default();

    let updates = WatchStream {
      id,
      receiver: UnboundedReceiverStream::new(receiver),
      registry: Arc::downgrade(&self.inner),
    };

    Ok(ChildWatch {
      children,
      updates: Box::pin(updates),
    })
  }
}

struct WatchStream {
  id: u64,
  receiver: UnboundedReceiverStream<Result<ChildEvent, RegistryError>>,
  registry: Weak<Mutex<Inner>>,
}

impl Stream for WatchStream {
  type Item = Result<ChildEvent, RegistryError>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    Pin::new(&mut self.receiver).poll_next(cx)
  }
}

impl Drop for WatchStream {
  fn drop(&mut self) {
    if let Some(registry) = self.registry.upgrade() {
      let mut inner = registry.lock();
      inner.subscribers.retain(|subscriber| subscriber.id != self.id);
      inner.watches_released += 1;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::WORKER_REGISTRATION_PATH;
  use tokio_stream::StreamExt;

  #[tokio::test]
  async fn test_watch_returns_snapshot_and_changes() {
    let registry = InMemoryRegistry::new();
    registry.register(WORKER_REGISTRATION_PATH, "w1");

    let mut watch = registry
      .watch_children("local", WORKER_REGISTRATION_PATH)
      .await
      .unwrap();
    assert_eq!(watch.children, vec!["w1".to_string()]);

    assert!(registry.register(WORKER_REGISTRATION_PATH, "w2"));
    assert!(!registry.register(WORKER_REGISTRATION_PATH, "w2"));
    assert!(registry.deregister(WORKER_REGISTRATION_PATH, "w1"));
    registry.register("/elsewhere", "ignored");

    assert_eq!(
      watch.updates.next().await,
      Some(Ok(ChildEvent::Created("w2".to_string())))
    );
    assert_eq!(
      watch.updates.next().await,
      Some(Ok(ChildEvent::Deleted("w1".to_string())))
    );
  }

  #[tokio::test]
  async fn test_unreachable_registry_fails_watch() {
    let registry = InMemoryRegistry::new();
    registry.set_reachable(false);

    let result = registry.watch_children("zk:2181", "/cluster/workers").await;
    assert!(matches!(
      result,
      Err(RegistryError::Unreachable { ref address }) if address == "zk:2181"
    ));
    assert_eq!(registry.watches_opened(), 0);
  }

  #[tokio::test]
  async fn test_failing_attempts_are_consumed() {
    let registry = InMemoryRegistry::new();
    registry.fail_next_watches(2);

    assert!(registry.watch_children("a", "/p").await.is_err());
    assert!(registry.watch_children("a", "/p").await.is_err());
    assert!(registry.watch_children("a", "/p").await.is_ok());
  }

  #[tokio::test]
  async fn test_dropping_stream_releases_subscription() {
    let registry = InMemoryRegistry::new();
    let watch = registry.watch_children("a", "/p").await.unwrap();
    assert_eq!(registry.active_watches(), 1);

    drop(watch);
    assert_eq!(registry.active_watches(), 0);
    assert_eq!(registry.watches_released(), 1);
  }

  #[tokio::test]
  async fn test_disconnect_errors_then_ends_stream() {
    let registry = InMemoryRegistry::new();
    let mut watch = registry.watch_children("a", "/p").await.unwrap();

    registry.disconnect();

    assert!(matches!(
      watch.updates.next().await,
      Some(Err(RegistryError::Disconnected(_)))
    ));
    assert_eq!(watch.updates.next().await, None);
    assert_eq!(registry.active_watches(), 0);
  }
}

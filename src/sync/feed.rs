//! Fan-out of diff results to subscribers.
//!
//! Consumers (tree views, status lines, anything reconciling its own
//! cache) subscribe once and get the full ordered change list of every
//! non-empty diff cycle. Empty cycles are not delivered.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use super::diff::Change;

type Callback<K, V> = Arc<dyn Fn(&[Change<K, V>]) + Send + Sync>;

struct FeedInner<K, V> {
  subscribers: Mutex<Vec<(u64, Callback<K, V>)>>,
  next_id: AtomicU64,
}

/// Pub/sub handle for one collection's change events.
///
/// Clones share the same subscriber list.
pub struct ChangeFeed<K, V> {
  inner: Arc<FeedInner<K, V>>,
}

impl<K, V> Clone for ChangeFeed<K, V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<K, V> ChangeFeed<K, V> {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(FeedInner {
        subscribers: Mutex::new(Vec::new()),
        next_id: AtomicU64::new(0),
      }),
    }
  }

  /// Register a callback for future change batches.
  pub fn subscribe(
    &self,
    callback: impl Fn(&[Change<K, V>]) + Send + Sync + 'static,
  ) -> Subscription<K, V> {
    let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
    self
      .inner
      .subscribers
      .lock()
      .push((id, Arc::new(callback)));
    Subscription {
      feed: Arc::downgrade(&self.inner),
      id,
    }
  }

  /// Deliver one batch to every subscriber, in subscription order.
  ///
  /// Empty batches are dropped. A panicking subscriber is logged and
  /// skipped; the remaining subscribers still receive the batch.
  pub fn emit(&self, changes: &[Change<K, V>]) {
    if changes.is_empty() {
      return;
    }

    let subscribers: Vec<Callback<K, V>> = self
      .inner
      .subscribers
      .lock()
      .iter()
      .map(|(_, callback)| Arc::clone(callback))
      .collect();

    for callback in subscribers {
      if catch_unwind(AssertUnwindSafe(|| callback(changes))).is_err() {
        warn!("change subscriber panicked, continuing delivery");
      }
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.inner.subscribers.lock().len()
  }
}

impl<K, V> Default for ChangeFeed<K, V> {
  fn default() -> Self {
    Self::new()
  }
}

/// Handle for one subscription; unsubscribing halts delivery to that
/// callback only.
pub struct Subscription<K, V> {
  feed: Weak<FeedInner<K, V>>,
  id: u64,
}

impl<K, V> Subscription<K, V> {
  pub fn unsubscribe(self) {
    if let Some(inner) = self.feed.upgrade() {
      inner.subscribers.lock().retain(|(id, _)| *id != self.id);
    }
  }
}

//! Polling loops that keep collections fresh.
//!
//! One loop per scheduled resource: refresh, decide the next delay from
//! the outcome, sleep, repeat. Conditional no-op requests are cheap
//! against the API quota, so an unchanged cycle reschedules quickly to
//! detect new data early, while a changed cycle backs off to the steady
//! interval. Loops for distinct resources are independent tasks; within
//! one loop the body is strictly sequential, so cycle N is fully applied
//! and delivered before cycle N+1 starts.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::collection::{CollectionSync, CycleOutcome};
use super::feed::ChangeFeed;
use crate::error::{SyncError, SyncResult};

/// Upper bound on fast-retry doublings after consecutive cache hits.
const MAX_BACKOFF_DOUBLINGS: u32 = 6;

/// Poll timing.
#[derive(Debug, Clone)]
pub struct PollConfig {
  /// Delay after an unchanged (or failed) cycle, doubled per consecutive
  /// cache hit up to `steady`.
  pub fast_retry: Duration,
  /// Delay after a changed cycle.
  pub steady: Duration,
}

impl Default for PollConfig {
  fn default() -> Self {
    Self {
      fast_retry: Duration::from_secs(1),
      steady: Duration::from_secs(5),
    }
  }
}

/// Poll bookkeeping for one scheduled resource.
struct PollState {
  consecutive_cache_hits: u32,
  attempts_remaining: Option<u32>,
}

/// Delay before the next attempt after a quiet cycle (unchanged or
/// failed). Always at most the steady interval.
fn unchanged_delay(config: &PollConfig, consecutive_hits: u32) -> Duration {
  let exponent = consecutive_hits
    .saturating_sub(1)
    .min(MAX_BACKOFF_DOUBLINGS);
  let delay = config.fast_retry.saturating_mul(1u32 << exponent);
  delay.min(config.steady)
}

/// Drives periodic refresh for registered collections.
///
/// Scheduling the same query key again replaces the live loop for it
/// (with a fresh attempt budget), matching how re-polling a run resets
/// its updater.
pub struct SyncScheduler {
  config: PollConfig,
  loops: Mutex<HashMap<String, Arc<watch::Sender<bool>>>>,
}

impl SyncScheduler {
  pub fn new(config: PollConfig) -> Self {
    Self {
      config,
      loops: Mutex::new(HashMap::new()),
    }
  }

  /// Start a polling loop for `collection`, forwarding every non-empty
  /// diff to `feed`.
  ///
  /// With `attempts` set, the loop stops after that many cycles (the
  /// collection itself stays usable and can be re-scheduled). The
  /// returned handle is the read surface consumers should use: its
  /// accessors gate on the first completed sync.
  pub fn schedule<K, V>(
    &self,
    collection: CollectionSync<K, V>,
    feed: ChangeFeed<K, V>,
    attempts: Option<u32>,
  ) -> ScheduledSync<K, V>
  where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
  {
    let key = collection.query_key().join("/");
    let (disposed_tx, disposed_rx) = watch::channel(false);
    let disposed_tx = Arc::new(disposed_tx);

    if let Some(previous) = self
      .loops
      .lock()
      .insert(key.clone(), Arc::clone(&disposed_tx))
    {
      debug!(key = %key, "replacing existing poll loop");
      let _ = previous.send(true);
    }

    tokio::spawn(run_loop(
      collection.clone(),
      feed.clone(),
      self.config.clone(),
      attempts,
      disposed_rx,
    ));

    ScheduledSync {
      collection,
      feed,
      disposed_tx,
    }
  }

  /// Stop every loop this scheduler started. Collections are left
  /// intact; in-flight fetches finish without being delivered.
  pub fn shutdown(&self) {
    for (key, disposed_tx) in self.loops.lock().drain() {
      debug!(key = %key, "stopping poll loop");
      let _ = disposed_tx.send(true);
    }
  }
}

impl Default for SyncScheduler {
  fn default() -> Self {
    Self::new(PollConfig::default())
  }
}

async fn run_loop<K, V>(
  collection: CollectionSync<K, V>,
  feed: ChangeFeed<K, V>,
  config: PollConfig,
  attempts: Option<u32>,
  mut disposed_rx: watch::Receiver<bool>,
) where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  let key = collection.query_key().join("/");
  let mut state = PollState {
    consecutive_cache_hits: 0,
    attempts_remaining: attempts,
  };

  loop {
    if let Some(remaining) = &mut state.attempts_remaining {
      if *remaining == 0 {
        debug!(key = %key, "attempt budget exhausted, stopping poll loop");
        break;
      }
      *remaining -= 1;
    }

    let outcome = collection.refresh().await;

    // Checked after resuming from the refresh: disposal during the
    // fetch means the result is neither applied nor delivered.
    if *disposed_rx.borrow() {
      break;
    }

    let delay = match outcome {
      Ok(CycleOutcome::Changed(changes)) => {
        state.consecutive_cache_hits = 0;
        if !changes.is_empty() {
          debug!(key = %key, changes = changes.len(), "delivering changes");
          feed.emit(&changes);
        }
        config.steady
      }
      Ok(CycleOutcome::Unchanged) => {
        state.consecutive_cache_hits += 1;
        unchanged_delay(&config, state.consecutive_cache_hits)
      }
      Err(SyncError::Disposed) => break,
      Err(err) => {
        // Failed cycles reschedule on the unchanged rules; the error
        // type does not tighten or loosen timing.
        warn!(key = %key, error = %err, "sync cycle failed, will retry");
        unchanged_delay(&config, state.consecutive_cache_hits + 1)
      }
    };

    tokio::select! {
      _ = tokio::time::sleep(delay) => {}
      _ = disposed_rx.changed() => break,
    }
  }
}

/// Read surface over a scheduled collection.
///
/// Every read gates on the first completed sync cycle, so consumers
/// never observe the empty pre-sync snapshot.
pub struct ScheduledSync<K, V> {
  collection: CollectionSync<K, V>,
  feed: ChangeFeed<K, V>,
  disposed_tx: Arc<watch::Sender<bool>>,
}

impl<K, V> ScheduledSync<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  /// Snapshot contents, once the first sync has completed.
  pub async fn items(&self) -> SyncResult<Vec<V>> {
    self.collection.when_ready().await?;
    Ok(self.collection.to_vec())
  }

  /// Entity by key, once the first sync has completed.
  pub async fn get(&self, key: &K) -> SyncResult<Option<V>> {
    self.collection.when_ready().await?;
    Ok(self.collection.get(key))
  }

  pub async fn when_ready(&self) -> SyncResult<()> {
    self.collection.when_ready().await
  }

  pub fn feed(&self) -> &ChangeFeed<K, V> {
    &self.feed
  }

  pub fn collection(&self) -> &CollectionSync<K, V> {
    &self.collection
  }

  /// Stop the poll loop (the pending sleep is cancelled synchronously)
  /// and dispose the collection: an in-flight fetch finishes but its
  /// result is discarded.
  pub fn dispose(&self) {
    let _ = self.disposed_tx.send(true);
    self.collection.dispose();
  }
}

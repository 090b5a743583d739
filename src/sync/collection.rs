//! Keyed snapshot of a remote collection with diff-producing refresh.
//!
//! A `CollectionSync` owns the local mirror of one remote resource. Each
//! `refresh()` cycle fetches the complete authoritative set (usually via
//! the conditional-request gateway, so an unchanged resource costs a
//! single 304), diffs it against the previous snapshot and reports typed
//! changes. Concurrent `refresh()` calls share one in-flight cycle.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::diff::{diff, Change};
use super::gateway::Fetched;
use crate::error::{SyncError, SyncResult};

/// How many consecutive failures before the first successful cycle turn
/// the ready signal into an error instead of leaving waiters hanging.
pub const DEFAULT_FIRST_SYNC_FAILURES: u32 = 5;

/// Boxed async fetch of the complete entity set (or the 304 sentinel).
pub type Fetcher<V> =
  Arc<dyn Fn() -> BoxFuture<'static, SyncResult<Fetched<Vec<V>>>> + Send + Sync>;

/// Comparator defining the ordered view of a snapshot.
pub type Comparator<V> = Arc<dyn Fn(&V, &V) -> std::cmp::Ordering + Send + Sync>;

/// Outcome of one refresh cycle, shared between concurrent callers.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome<K, V> {
  /// The server confirmed the snapshot is current; nothing was touched.
  Unchanged,
  /// A fresh set was fetched and diffed. The change list is empty when
  /// the fetched data was structurally identical to the snapshot.
  Changed(Arc<Vec<Change<K, V>>>),
}

impl<K, V> CycleOutcome<K, V> {
  pub fn changes(&self) -> &[Change<K, V>] {
    match self {
      CycleOutcome::Unchanged => &[],
      CycleOutcome::Changed(changes) => changes,
    }
  }
}

/// Tuning knobs for a collection.
pub struct SyncOptions<V> {
  /// Ordering for `to_vec()`; fetch scan order when absent.
  pub comparator: Option<Comparator<V>>,
  /// See [`DEFAULT_FIRST_SYNC_FAILURES`].
  pub first_sync_failures: u32,
}

impl<V> Default for SyncOptions<V> {
  fn default() -> Self {
    Self {
      comparator: None,
      first_sync_failures: DEFAULT_FIRST_SYNC_FAILURES,
    }
  }
}

impl<V> SyncOptions<V> {
  /// Options with an ordered view.
  pub fn ordered_by(
    comparator: impl Fn(&V, &V) -> std::cmp::Ordering + Send + Sync + 'static,
  ) -> Self {
    Self {
      comparator: Some(Arc::new(comparator)),
      ..Self::default()
    }
  }
}

#[derive(Debug, Clone)]
enum ReadyState {
  Pending,
  Ready,
  Failed(SyncError),
}

type SharedCycle<K, V> = Shared<BoxFuture<'static, SyncResult<CycleOutcome<K, V>>>>;

struct State<K, V> {
  items: HashMap<K, V>,
  order: Vec<K>,
  inflight: Option<SharedCycle<K, V>>,
  failed_before_ready: u32,
}

struct SyncShared<K, V> {
  query_key: Vec<String>,
  fetcher: Fetcher<V>,
  key_of: Arc<dyn Fn(&V) -> K + Send + Sync>,
  comparator: Option<Comparator<V>>,
  first_sync_failures: u32,
  state: Mutex<State<K, V>>,
  ready_tx: watch::Sender<ReadyState>,
  ready_rx: watch::Receiver<ReadyState>,
  disposed: AtomicBool,
}

/// Local mirror of one remote collection.
///
/// Cloning is cheap and clones share the same snapshot, like handles to
/// one store.
pub struct CollectionSync<K, V> {
  shared: Arc<SyncShared<K, V>>,
}

impl<K, V> Clone for CollectionSync<K, V> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<K, V> CollectionSync<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  /// Create a collection with default options.
  ///
  /// `query_key` identifies the logical resource in logs. The fetcher
  /// must return the complete authoritative set; the key extractor must
  /// yield a unique key per entity (duplicates make the cycle fail as a
  /// malformed response).
  pub fn new<F, Fut>(
    query_key: Vec<String>,
    fetcher: F,
    key_of: impl Fn(&V) -> K + Send + Sync + 'static,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<Fetched<Vec<V>>>> + Send + 'static,
  {
    Self::with_options(query_key, fetcher, key_of, SyncOptions::default())
  }

  pub fn with_options<F, Fut>(
    query_key: Vec<String>,
    fetcher: F,
    key_of: impl Fn(&V) -> K + Send + Sync + 'static,
    options: SyncOptions<V>,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<Fetched<Vec<V>>>> + Send + 'static,
  {
    let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);
    Self {
      shared: Arc::new(SyncShared {
        query_key,
        fetcher: Arc::new(move || fetcher().boxed()),
        key_of: Arc::new(key_of),
        comparator: options.comparator,
        first_sync_failures: options.first_sync_failures.max(1),
        state: Mutex::new(State {
          items: HashMap::new(),
          order: Vec::new(),
          inflight: None,
          failed_before_ready: 0,
        }),
        ready_tx,
        ready_rx,
        disposed: AtomicBool::new(false),
      }),
    }
  }

  /// Run one fetch-diff-apply cycle, or join the cycle already in flight.
  ///
  /// Never more than one upstream call is outstanding per collection:
  /// concurrent callers await the same cycle and receive the same
  /// outcome. A failed cycle rejects every caller and leaves the
  /// snapshot at its last known-good state.
  pub async fn refresh(&self) -> SyncResult<CycleOutcome<K, V>> {
    if self.is_disposed() {
      return Err(SyncError::Disposed);
    }

    let cycle = {
      let mut state = self.shared.state.lock();
      match &state.inflight {
        Some(cycle) => cycle.clone(),
        None => {
          let cycle = run_cycle(Arc::clone(&self.shared)).boxed().shared();
          state.inflight = Some(cycle.clone());
          cycle
        }
      }
    };

    cycle.await
  }

  /// Resolves once the first cycle has completed (an unchanged cycle
  /// counts: it confirms the current, possibly empty, state). If every
  /// attempt up to the configured limit fails before any cycle
  /// succeeds, this returns the failure instead of waiting forever.
  pub async fn when_ready(&self) -> SyncResult<()> {
    let mut rx = self.shared.ready_rx.clone();
    let state = rx
      .wait_for(|s| !matches!(s, ReadyState::Pending))
      .await
      .map_err(|_| SyncError::Disposed)?;
    match &*state {
      ReadyState::Failed(err) => Err(err.clone()),
      _ => Ok(()),
    }
  }

  /// Entities in the snapshot, comparator order when one was supplied,
  /// fetch scan order otherwise. Never blocks on the network.
  pub fn to_vec(&self) -> Vec<V> {
    let state = self.shared.state.lock();
    state
      .order
      .iter()
      .filter_map(|key| state.items.get(key).cloned())
      .collect()
  }

  /// Entity by key from the last snapshot.
  pub fn get(&self, key: &K) -> Option<V> {
    self.shared.state.lock().items.get(key).cloned()
  }

  pub fn len(&self) -> usize {
    self.shared.state.lock().items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn query_key(&self) -> Vec<String> {
    self.shared.query_key.clone()
  }

  /// Terminal: a cycle resuming from its fetch after this point discards
  /// its result without touching the snapshot.
  pub fn dispose(&self) {
    self.shared.disposed.store(true, AtomicOrdering::SeqCst);
  }

  pub fn is_disposed(&self) -> bool {
    self.shared.disposed.load(AtomicOrdering::SeqCst)
  }
}

async fn run_cycle<K, V>(shared: Arc<SyncShared<K, V>>) -> SyncResult<CycleOutcome<K, V>>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + PartialEq + Send + Sync + 'static,
{
  debug!(query_key = %shared.query_key.join("/"), "refreshing collection");
  let fetched = (shared.fetcher)().await;

  // Checked after resuming from the await: a disposal that happened
  // during the fetch must not apply results or resolve readiness.
  let result = if shared.disposed.load(AtomicOrdering::SeqCst) {
    Err(SyncError::Disposed)
  } else {
    match fetched {
      Ok(Fetched::Unchanged) => {
        debug!(query_key = %shared.query_key.join("/"), "no changes");
        Ok(CycleOutcome::Unchanged)
      }
      Ok(Fetched::Changed(items)) => apply_items(&shared, items),
      Err(err) => Err(err),
    }
  };

  shared.state.lock().inflight = None;

  match &result {
    Ok(_) => resolve_ready(&shared),
    Err(SyncError::Disposed) => {}
    Err(err) => record_failure_before_ready(&shared, err),
  }

  result
}

/// Diff the fetched set against the snapshot and swap the snapshot in,
/// all under one lock so readers never observe a partial update.
fn apply_items<K, V>(
  shared: &SyncShared<K, V>,
  items: Vec<V>,
) -> SyncResult<CycleOutcome<K, V>>
where
  K: Eq + Hash + Clone,
  V: Clone + PartialEq,
{
  let mut keyed: Vec<(K, V)> = Vec::with_capacity(items.len());
  let mut seen: HashSet<K> = HashSet::with_capacity(items.len());
  for value in items {
    let key = (shared.key_of)(&value);
    if !seen.insert(key.clone()) {
      return Err(SyncError::Malformed(format!(
        "duplicate key in fetched set for {}",
        shared.query_key.join("/")
      )));
    }
    keyed.push((key, value));
  }

  let mut state = shared.state.lock();
  let changes = diff(&state.items, &keyed, |a, b| a == b);

  if let Some(comparator) = &shared.comparator {
    keyed.sort_by(|(_, a), (_, b)| comparator(a, b));
  }
  state.order = keyed.iter().map(|(key, _)| key.clone()).collect();
  state.items = keyed.into_iter().collect();

  debug!(
    query_key = %shared.query_key.join("/"),
    changes = changes.len(),
    total = state.items.len(),
    "collection updated"
  );

  Ok(CycleOutcome::Changed(Arc::new(changes)))
}

fn resolve_ready<K, V>(shared: &SyncShared<K, V>) {
  shared.ready_tx.send_if_modified(|state| {
    if matches!(state, ReadyState::Ready) {
      false
    } else {
      *state = ReadyState::Ready;
      true
    }
  });
}

fn record_failure_before_ready<K, V>(shared: &SyncShared<K, V>, err: &SyncError) {
  if !matches!(*shared.ready_rx.borrow(), ReadyState::Pending) {
    return;
  }
  let failed = {
    let mut state = shared.state.lock();
    state.failed_before_ready += 1;
    if state.failed_before_ready >= shared.first_sync_failures {
      Some(ReadyState::Failed(SyncError::NeverReady {
        attempts: state.failed_before_ready,
        message: err.to_string(),
      }))
    } else {
      None
    }
  };
  if let Some(failed) = failed {
    shared.ready_tx.send_replace(failed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::VecDeque;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  #[derive(Debug, Clone, PartialEq, Eq)]
  struct Run {
    id: u64,
    status: String,
  }

  fn run(id: u64, status: &str) -> Run {
    Run {
      id,
      status: status.to_string(),
    }
  }

  type Script = Arc<Mutex<VecDeque<SyncResult<Fetched<Vec<Run>>>>>>;

  fn scripted(script: Vec<SyncResult<Fetched<Vec<Run>>>>) -> (Script, CollectionSync<u64, Run>) {
    let script: Script = Arc::new(Mutex::new(script.into()));
    let fetch_script = script.clone();
    let collection = CollectionSync::new(
      vec!["runs".to_string(), "octo/demo".to_string()],
      move || {
        let script = fetch_script.clone();
        async move {
          script
            .lock()
            .pop_front()
            .unwrap_or(Err(SyncError::Network("script exhausted".to_string())))
        }
      },
      |run: &Run| run.id,
    );
    (script, collection)
  }

  fn changed(runs: Vec<Run>) -> SyncResult<Fetched<Vec<Run>>> {
    Ok(Fetched::Changed(runs))
  }

  #[tokio::test]
  async fn fetch_unchanged_fetch_fetch_scenario() {
    let (_, collection) = scripted(vec![
      changed(vec![run(1, "queued")]),
      Ok(Fetched::Unchanged),
      changed(vec![run(1, "completed"), run(2, "queued")]),
      changed(vec![run(2, "queued")]),
    ]);

    let first = collection.refresh().await.unwrap();
    assert_eq!(first.changes().len(), 1);
    assert!(matches!(&first.changes()[0], Change::Insert { key: 1, .. }));

    let second = collection.refresh().await.unwrap();
    assert_eq!(second, CycleOutcome::Unchanged);
    assert_eq!(collection.get(&1), Some(run(1, "queued")));

    let third = collection.refresh().await.unwrap();
    let changes = third.changes();
    assert_eq!(changes.len(), 2);
    assert!(matches!(&changes[0], Change::Update { key: 1, value } if value.status == "completed"));
    assert!(matches!(&changes[1], Change::Insert { key: 2, .. }));

    let fourth = collection.refresh().await.unwrap();
    assert_eq!(fourth.changes().to_vec(), vec![Change::Delete { key: 1 }]);
    assert_eq!(collection.len(), 1);
    assert_eq!(collection.get(&2), Some(run(2, "queued")));
  }

  #[tokio::test]
  async fn concurrent_refreshes_share_one_upstream_call() {
    let calls = Arc::new(AtomicU32::new(0));
    let fetch_calls = calls.clone();
    let collection = CollectionSync::new(
      vec!["runs".to_string()],
      move || {
        let calls = fetch_calls.clone();
        async move {
          calls.fetch_add(1, AtomicOrdering::SeqCst);
          tokio::time::sleep(Duration::from_millis(50)).await;
          changed(vec![run(1, "queued")])
        }
      },
      |run: &Run| run.id,
    );

    let (a, b) = tokio::join!(collection.refresh(), collection.refresh());

    assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(a.unwrap(), b.unwrap());

    // The next refresh after completion starts a fresh cycle.
    collection.refresh().await.unwrap();
    assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
  }

  #[tokio::test]
  async fn ready_resolves_after_first_cycle() {
    let (_, collection) = scripted(vec![changed(vec![run(1, "queued")])]);

    let waiter = collection.clone();
    let ready = tokio::spawn(async move { waiter.when_ready().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!ready.is_finished());

    collection.refresh().await.unwrap();
    ready.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn unchanged_first_cycle_counts_as_ready() {
    let (_, collection) = scripted(vec![Ok(Fetched::Unchanged)]);

    collection.refresh().await.unwrap();
    collection.when_ready().await.unwrap();
    assert!(collection.is_empty());
  }

  #[tokio::test]
  async fn failed_cycle_keeps_last_known_good_snapshot() {
    let (_, collection) = scripted(vec![
      changed(vec![run(1, "queued")]),
      Err(SyncError::Network("connection reset".to_string())),
    ]);

    collection.refresh().await.unwrap();
    let err = collection.refresh().await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));

    assert_eq!(collection.to_vec(), vec![run(1, "queued")]);
    // Readers that passed the ready gate never observe the failure.
    collection.when_ready().await.unwrap();
  }

  #[tokio::test]
  async fn duplicate_keys_are_a_malformed_cycle() {
    let (_, collection) = scripted(vec![
      changed(vec![run(1, "queued")]),
      changed(vec![run(2, "queued"), run(2, "completed")]),
    ]);

    collection.refresh().await.unwrap();
    let err = collection.refresh().await.unwrap_err();
    assert!(matches!(err, SyncError::Malformed(_)));
    // Snapshot retained from the last good cycle.
    assert_eq!(collection.to_vec(), vec![run(1, "queued")]);
  }

  #[tokio::test]
  async fn ready_fails_after_consecutive_first_sync_failures() {
    let script: Script = Arc::new(Mutex::new(
      vec![
        Err(SyncError::Network("down".to_string())),
        Err(SyncError::Network("down".to_string())),
      ]
      .into(),
    ));
    let fetch_script = script.clone();
    let collection = CollectionSync::with_options(
      vec!["runs".to_string()],
      move || {
        let script = fetch_script.clone();
        async move {
          script
            .lock()
            .pop_front()
            .unwrap_or(Err(SyncError::Network("script exhausted".to_string())))
        }
      },
      |run: &Run| run.id,
      SyncOptions {
        first_sync_failures: 2,
        ..SyncOptions::default()
      },
    );

    assert!(collection.refresh().await.is_err());
    assert!(collection.refresh().await.is_err());

    let err = collection.when_ready().await.unwrap_err();
    assert!(matches!(err, SyncError::NeverReady { attempts: 2, .. }));
  }

  #[tokio::test]
  async fn comparator_orders_the_snapshot_view() {
    let fetched = vec![run(2, "queued"), run(9, "queued"), run(4, "queued")];
    let script: Script = Arc::new(Mutex::new(vec![changed(fetched)].into()));
    let fetch_script = script.clone();
    let collection = CollectionSync::with_options(
      vec!["runs".to_string()],
      move || {
        let script = fetch_script.clone();
        async move {
          script
            .lock()
            .pop_front()
            .unwrap_or(Err(SyncError::Network("script exhausted".to_string())))
        }
      },
      |run: &Run| run.id,
      SyncOptions::ordered_by(|a: &Run, b: &Run| b.id.cmp(&a.id)),
    );

    collection.refresh().await.unwrap();
    let ids: Vec<u64> = collection.to_vec().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![9, 4, 2]);
  }

  #[tokio::test]
  async fn disposal_during_flight_discards_the_result() {
    let collection = CollectionSync::new(
      vec!["runs".to_string()],
      move || async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        changed(vec![run(1, "queued")])
      },
      |run: &Run| run.id,
    );

    let refresher = collection.clone();
    let cycle = tokio::spawn(async move { refresher.refresh().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    collection.dispose();

    let err = cycle.await.unwrap().unwrap_err();
    assert_eq!(err, SyncError::Disposed);
    assert!(collection.is_empty());

    // Disposed collections reject new cycles outright.
    assert_eq!(collection.refresh().await.unwrap_err(), SyncError::Disposed);
  }
}

//! Pure diffing of keyed snapshots.
//!
//! The diff is computed between the previous snapshot and the complete
//! set returned by a fetch. It has no network or clock dependency, which
//! keeps the hardest invariants (ordering, round-trip) testable in
//! isolation.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// A single observed change to a keyed collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<K, V> {
  /// The key was absent from the previous snapshot.
  Insert { key: K, value: V },
  /// The key existed but its value is no longer structurally equal.
  Update { key: K, value: V },
  /// The key is absent from the new authoritative set.
  Delete { key: K },
}

impl<K, V> Change<K, V> {
  pub fn key(&self) -> &K {
    match self {
      Change::Insert { key, .. } | Change::Update { key, .. } | Change::Delete { key } => key,
    }
  }

  /// The new value, absent for deletes.
  pub fn value(&self) -> Option<&V> {
    match self {
      Change::Insert { value, .. } | Change::Update { value, .. } => Some(value),
      Change::Delete { .. } => None,
    }
  }
}

/// Compute the changes that turn `old` into the collection described by
/// `new`.
///
/// `new` must be the complete authoritative set for the resource; delete
/// detection is meaningless on a partial page. Insert/Update entries are
/// emitted in `new` scan order, followed by all Delete entries.
pub fn diff<K, V, F>(old: &HashMap<K, V>, new: &[(K, V)], equals: F) -> Vec<Change<K, V>>
where
  K: Eq + Hash + Clone,
  V: Clone,
  F: Fn(&V, &V) -> bool,
{
  let mut changes = Vec::new();

  let new_keys: HashSet<&K> = new.iter().map(|(k, _)| k).collect();

  for (key, value) in new {
    match old.get(key) {
      None => changes.push(Change::Insert {
        key: key.clone(),
        value: value.clone(),
      }),
      Some(prior) if !equals(prior, value) => changes.push(Change::Update {
        key: key.clone(),
        value: value.clone(),
      }),
      Some(_) => {}
    }
  }

  for key in old.keys() {
    if !new_keys.contains(key) {
      changes.push(Change::Delete { key: key.clone() });
    }
  }

  changes
}

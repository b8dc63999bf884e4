//! Server-authoritative key/value map and the read-only mirror clients keep of it
//!
//! The server owns a [`ReplicatedMap`]; every committed mutation produces a
//! [`MapBatch`] tagged with the next revision number. Batches are handed to
//! local listeners in emission order and returned to the caller so they can be
//! put on the wire. Clients hold a [`MirrorMap`] which is seeded from a
//! [`MapSnapshot`] at join time and then only accepts batches whose revision
//! directly follows the one it has, so a dropped or reordered datagram is
//! detected instead of silently producing a divergent view.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single entry mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapChange<K, V> {
    Upsert { key: K, value: V },
    Remove { key: K, previous: V },
}

impl<K, V> MapChange<K, V> {
    pub fn key(&self) -> &K {
        match self {
            MapChange::Upsert { key, .. } | MapChange::Remove { key, .. } => key,
        }
    }
}

/// Changes committed together under one revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapBatch<K, V> {
    pub revision: u64,
    pub changes: Vec<MapChange<K, V>>,
}

/// Full map state at a given revision, sent to joining clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSnapshot<K, V> {
    pub revision: u64,
    pub entries: Vec<(K, V)>,
}

type Listener<K, V> = Box<dyn FnMut(&MapBatch<K, V>) + Send>;

/// Writer side of a replicated map. Only the authoritative process holds one.
pub struct ReplicatedMap<K, V> {
    entries: BTreeMap<K, V>,
    revision: u64,
    listeners: Vec<Listener<K, V>>,
}

impl<K, V> ReplicatedMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            revision: 0,
            listeners: Vec::new(),
        }
    }

    /// Attaches a listener that receives every committed batch exactly once,
    /// in emission order
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&MapBatch<K, V>) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Inserts or replaces an entry and commits it as its own batch
    pub fn set(&mut self, key: K, value: V) -> Option<MapBatch<K, V>> {
        self.transact(|tx| tx.set(key, value))
    }

    /// Removes an entry if present. Returns `None` when nothing changed.
    pub fn remove(&mut self, key: &K) -> Option<MapBatch<K, V>> {
        self.transact(|tx| {
            tx.remove(key);
        })
    }

    /// Applies several mutations and publishes them as one batch.
    ///
    /// Listeners never observe the state between the individual mutations.
    /// An empty transaction commits nothing and does not advance the revision.
    pub fn transact<F>(&mut self, f: F) -> Option<MapBatch<K, V>>
    where
        F: FnOnce(&mut MapTransaction<'_, K, V>),
    {
        let mut tx = MapTransaction {
            entries: &mut self.entries,
            changes: Vec::new(),
        };
        f(&mut tx);

        if tx.changes.is_empty() {
            return None;
        }

        self.revision += 1;
        let batch = MapBatch {
            revision: self.revision,
            changes: tx.changes,
        };

        for listener in &mut self.listeners {
            listener(&batch);
        }

        Some(batch)
    }

    pub fn snapshot(&self) -> MapSnapshot<K, V> {
        MapSnapshot {
            revision: self.revision,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> Default for ReplicatedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for ReplicatedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedMap")
            .field("entries", &self.entries)
            .field("revision", &self.revision)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Staged mutations of a [`ReplicatedMap::transact`] call
pub struct MapTransaction<'a, K, V> {
    entries: &'a mut BTreeMap<K, V>,
    changes: Vec<MapChange<K, V>>,
}

impl<K, V> MapTransaction<'_, K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    pub fn set(&mut self, key: K, value: V) {
        self.entries.insert(key.clone(), value.clone());
        self.changes.push(MapChange::Upsert { key, value });
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let previous = self.entries.remove(key)?;
        self.changes.push(MapChange::Remove {
            key: key.clone(),
            previous: previous.clone(),
        });
        Some(previous)
    }
}

/// Result of offering a batch to a [`MirrorMap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Batch is at or below the mirror's revision and was ignored
    Stale,
    /// A batch went missing; the mirror needs a fresh snapshot
    Gap { expected: u64, received: u64 },
    /// No snapshot has been loaded yet
    NotSynced,
}

/// Read-only copy of a [`ReplicatedMap`] kept by a client
#[derive(Debug, Clone)]
pub struct MirrorMap<K, V> {
    entries: BTreeMap<K, V>,
    revision: Option<u64>,
}

impl<K, V> MirrorMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            revision: None,
        }
    }

    /// Replaces the whole state. Snapshots older than the current revision
    /// are ignored; returns whether the snapshot was taken.
    pub fn load_snapshot(&mut self, snapshot: &MapSnapshot<K, V>) -> bool {
        if let Some(current) = self.revision {
            if snapshot.revision < current {
                return false;
            }
        }

        self.entries = snapshot.entries.iter().cloned().collect();
        self.revision = Some(snapshot.revision);
        true
    }

    pub fn apply(&mut self, batch: &MapBatch<K, V>) -> ApplyOutcome {
        let current = match self.revision {
            Some(revision) => revision,
            None => return ApplyOutcome::NotSynced,
        };

        if batch.revision <= current {
            return ApplyOutcome::Stale;
        }

        if batch.revision != current + 1 {
            return ApplyOutcome::Gap {
                expected: current + 1,
                received: batch.revision,
            };
        }

        for change in &batch.changes {
            match change {
                MapChange::Upsert { key, value } => {
                    self.entries.insert(key.clone(), value.clone());
                }
                MapChange::Remove { key, .. } => {
                    self.entries.remove(key);
                }
            }
        }
        self.revision = Some(batch.revision);
        ApplyOutcome::Applied
    }

    /// Drops sync status so that only the next snapshot is accepted
    pub fn invalidate(&mut self) {
        self.revision = None;
    }

    pub fn is_synced(&self) -> bool {
        self.revision.is_some()
    }

    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_map(&self) -> BTreeMap<K, V> {
        self.entries.clone()
    }
}

impl<K: Ord + Clone, V: Clone> Default for MirrorMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_set_and_remove_advance_revision() {
        let mut map = ReplicatedMap::<u32, String>::new();
        assert_eq!(map.revision(), 0);

        let batch = map.set(1, "a".to_string()).unwrap();
        assert_eq!(batch.revision, 1);
        assert_eq!(
            batch.changes,
            vec![MapChange::Upsert {
                key: 1,
                value: "a".to_string()
            }]
        );

        let batch = map.remove(&1).unwrap();
        assert_eq!(batch.revision, 2);
        assert_eq!(
            batch.changes,
            vec![MapChange::Remove {
                key: 1,
                previous: "a".to_string()
            }]
        );
        assert!(map.is_empty());
    }

    #[test]
    fn test_remove_missing_key_emits_nothing() {
        let mut map = ReplicatedMap::<u32, u32>::new();
        let events = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&events);
        map.subscribe(move |_| *counter.lock().unwrap() += 1);

        assert!(map.remove(&7).is_none());
        assert_eq!(map.revision(), 0);
        assert_eq!(*events.lock().unwrap(), 0);
    }

    #[test]
    fn test_listeners_receive_batches_in_order() {
        let mut map = ReplicatedMap::<u32, u32>::new();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&first);
        map.subscribe(move |batch| sink.lock().unwrap().push(batch.revision));
        let sink = Arc::clone(&second);
        map.subscribe(move |batch| sink.lock().unwrap().push(batch.revision));

        map.set(1, 10);
        map.set(2, 20);
        map.remove(&1);

        assert_eq!(*first.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*second.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_transaction_is_one_batch() {
        let mut map = ReplicatedMap::<u32, u32>::new();
        map.set(1, 99);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        map.subscribe(move |batch| sink.lock().unwrap().push(batch.clone()));

        let batch = map
            .transact(|tx| {
                tx.remove(&1);
                tx.set(2, 99);
            })
            .unwrap();

        assert_eq!(batch.changes.len(), 2);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], batch);
    }

    #[test]
    fn test_mirror_requires_snapshot() {
        let mut map = ReplicatedMap::<u32, u32>::new();
        let mut mirror = MirrorMap::new();

        let batch = map.set(1, 1).unwrap();
        assert_eq!(mirror.apply(&batch), ApplyOutcome::NotSynced);
        assert!(!mirror.is_synced());

        assert!(mirror.load_snapshot(&map.snapshot()));
        assert_eq!(mirror.get(&1), Some(&1));
        assert_eq!(mirror.revision(), Some(1));
    }

    #[test]
    fn test_mirror_detects_gap_and_stale() {
        let mut map = ReplicatedMap::<u32, u32>::new();
        let mut mirror = MirrorMap::new();
        mirror.load_snapshot(&map.snapshot());

        let first = map.set(1, 1).unwrap();
        let second = map.set(2, 2).unwrap();

        assert_eq!(
            mirror.apply(&second),
            ApplyOutcome::Gap {
                expected: 1,
                received: 2
            }
        );
        assert_eq!(mirror.apply(&first), ApplyOutcome::Applied);
        assert_eq!(mirror.apply(&first), ApplyOutcome::Stale);
        assert_eq!(mirror.apply(&second), ApplyOutcome::Applied);
        let expected: BTreeMap<u32, u32> = map.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(mirror.to_map(), expected);
    }

    #[test]
    fn test_mirror_ignores_older_snapshot() {
        let mut map = ReplicatedMap::<u32, u32>::new();
        let old = map.snapshot();
        map.set(1, 1);

        let mut mirror = MirrorMap::new();
        assert!(mirror.load_snapshot(&map.snapshot()));
        assert!(!mirror.load_snapshot(&old));
        assert_eq!(mirror.len(), 1);

        mirror.invalidate();
        assert!(mirror.load_snapshot(&old));
        assert!(mirror.is_empty());
    }
}

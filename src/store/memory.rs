use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::{Change, ChangeFeed, Versioned};

/// Why a conditional write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConflict {
    /// The row does not exist (any more).
    Missing,
    /// The row exists but its version moved on.
    Stale,
    /// Insert of a key that is already present.
    Exists,
}

struct TableState<K, V> {
    rows: BTreeMap<K, V>,
    subscribers: Vec<mpsc::UnboundedSender<Change<V>>>,
}

/// Ordered in-memory table with versioned rows and a change feed.
///
/// Changes are published while the table lock is held, so every subscriber
/// observes the changes of one key in write order.
pub struct MemoryTable<K, V> {
    state: Mutex<TableState<K, V>>,
}

impl<K: Ord + Clone, V: Clone + Versioned> Default for MemoryTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone + Versioned> MemoryTable<K, V> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                rows: BTreeMap::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState<K, V>> {
        // Every write is a single map operation, so a poisoned map is intact.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(state: &mut TableState<K, V>, change: Change<V>) {
        state
            .subscribers
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    pub fn subscribe(&self) -> ChangeFeed<V> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().rows.get(key).cloned()
    }

    pub fn insert(&self, key: K, mut value: V) -> Result<V, WriteConflict> {
        let mut state = self.lock();
        if state.rows.contains_key(&key) {
            return Err(WriteConflict::Exists);
        }
        value.set_version(1);
        state.rows.insert(key, value.clone());
        Self::publish(&mut state, Change::insert(value.clone()));
        Ok(value)
    }

    /// Unconditional write; creates the row when absent.
    pub fn put(&self, key: K, mut value: V) -> V {
        let mut state = self.lock();
        let old = state.rows.get(&key).cloned();
        value.set_version(old.as_ref().map_or(1, |o| o.version() + 1));
        state.rows.insert(key, value.clone());
        let change = match old {
            Some(old) => Change::modify(old, value.clone()),
            None => Change::insert(value.clone()),
        };
        Self::publish(&mut state, change);
        value
    }

    /// Write only if the stored row still carries `value.version()`.
    pub fn put_if(&self, key: K, mut value: V) -> Result<V, WriteConflict> {
        let mut state = self.lock();
        let old = match state.rows.get(&key) {
            Some(old) if old.version() == value.version() => old.clone(),
            Some(_) => return Err(WriteConflict::Stale),
            None => return Err(WriteConflict::Missing),
        };
        value.set_version(old.version() + 1);
        state.rows.insert(key, value.clone());
        Self::publish(&mut state, Change::modify(old, value.clone()));
        Ok(value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.lock();
        let old = state.rows.remove(key)?;
        Self::publish(&mut state, Change::remove(old.clone()));
        Some(old)
    }

    /// Rows with keys in `range`, in key order, filtered by `keep`.
    pub fn scan<R, F>(&self, range: R, mut keep: F) -> Vec<(K, V)>
    where
        R: std::ops::RangeBounds<K>,
        F: FnMut(&K, &V) -> bool,
    {
        self.lock()
            .rows
            .range(range)
            .filter(|(k, v)| keep(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeKind;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        value: &'static str,
        version: u64,
    }

    impl Versioned for Row {
        fn version(&self) -> u64 {
            self.version
        }
        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    fn row(value: &'static str) -> Row {
        Row { value, version: 0 }
    }

    #[test]
    fn put_bumps_version_and_feeds_changes() {
        let table: MemoryTable<u32, Row> = MemoryTable::new();
        let mut feed = table.subscribe();

        let first = table.put(1, row("a"));
        assert_eq!(first.version, 1);
        let second = table.put(1, row("b"));
        assert_eq!(second.version, 2);
        table.remove(&1);

        let c1 = feed.try_recv().unwrap();
        assert_eq!(c1.kind, ChangeKind::Insert);
        let c2 = feed.try_recv().unwrap();
        assert_eq!(c2.kind, ChangeKind::Modify);
        assert_eq!(c2.old.unwrap().value, "a");
        assert_eq!(c2.new.unwrap().value, "b");
        let c3 = feed.try_recv().unwrap();
        assert_eq!(c3.kind, ChangeKind::Remove);
        assert!(feed.try_recv().is_err());
    }

    #[test]
    fn conditional_put_rejects_stale_and_missing() {
        let table: MemoryTable<u32, Row> = MemoryTable::new();
        let stored = table.insert(7, row("a")).unwrap();

        let mut update = stored.clone();
        update.value = "b";
        table.put_if(7, update.clone()).unwrap();

        // same base version again is now stale
        assert_eq!(table.put_if(7, update).unwrap_err(), WriteConflict::Stale);
        assert_eq!(table.put_if(8, row("x")).unwrap_err(), WriteConflict::Missing);
        assert_eq!(table.insert(7, row("c")).unwrap_err(), WriteConflict::Exists);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let table: MemoryTable<u32, Row> = MemoryTable::new();
        let feed = table.subscribe();
        drop(feed);
        table.put(1, row("a"));
        assert_eq!(table.lock().subscribers.len(), 0);
    }
}

//! Bounded, key-addressed storage of fetched pages.

use chrono::Duration;
use indexmap::IndexMap;

use super::traits::{CacheEntry, ListRow};
use crate::query_state::QueryKey;

pub const DEFAULT_CAPACITY: usize = 20;

/// LRU cache of result pages.
///
/// Entries are kept in access order: index 0 is the least recently used.
/// Staleness is advisory; `get` returns stale entries too and leaves the
/// refetch decision to the caller.
#[derive(Debug)]
pub struct ListCache<R> {
  entries: IndexMap<QueryKey, CacheEntry<R>>,
  capacity: usize,
  stale_after: Option<Duration>,
}

impl<R: ListRow> ListCache<R> {
  pub fn new(capacity: usize) -> Self {
    Self {
      entries: IndexMap::with_capacity(capacity.min(64)),
      capacity: capacity.max(1),
      stale_after: None,
    }
  }

  /// Treat entries older than `stale_after` as stale.
  pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
    self.stale_after = stale_after;
    self
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn stale_after(&self) -> Option<Duration> {
    self.stale_after
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Look up an entry and mark it most recently used.
  pub fn get(&mut self, key: &QueryKey) -> Option<&CacheEntry<R>> {
    let index = self.entries.get_index_of(key)?;
    let last = self.entries.len() - 1;
    self.entries.move_index(index, last);
    self.entries.get_index(last).map(|(_, entry)| entry)
  }

  /// Look up an entry without touching its recency.
  pub fn peek(&self, key: &QueryKey) -> Option<&CacheEntry<R>> {
    self.entries.get(key)
  }

  pub fn is_fresh(&self, entry: &CacheEntry<R>) -> bool {
    !entry.is_stale(self.stale_after)
  }

  /// Insert or replace the entry for `entry.key`, evicting least recently
  /// used entries past capacity. Returns the evicted keys.
  pub fn put(&mut self, entry: CacheEntry<R>) -> Vec<QueryKey> {
    let key = entry.key.clone();
    self.entries.shift_remove(&key);
    self.entries.insert(key, entry);

    let mut evicted = Vec::new();
    while self.entries.len() > self.capacity {
      match self.entries.shift_remove_index(0) {
        Some((key, _)) => evicted.push(key),
        None => break,
      }
    }
    evicted
  }

  /// Mark every entry whose key matches as stale. Entries stay readable.
  pub fn invalidate<P>(&mut self, mut predicate: P) -> usize
  where
    P: FnMut(&QueryKey) -> bool,
  {
    let mut count = 0;
    for (key, entry) in self.entries.iter_mut() {
      if predicate(key) {
        entry.stale = true;
        count += 1;
      }
    }
    count
  }

  /// Mark every entry containing one of `ids` as stale.
  pub fn invalidate_rows(&mut self, ids: &[String]) -> usize {
    let mut count = 0;
    for entry in self.entries.values_mut() {
      if ids.iter().any(|id| entry.contains_row(id)) {
        entry.stale = true;
        count += 1;
      }
    }
    count
  }

  pub fn remove(&mut self, key: &QueryKey) -> Option<CacheEntry<R>> {
    self.entries.shift_remove(key)
  }

  pub fn evict_all(&mut self) {
    self.entries.clear();
  }

  /// Keys from least to most recently used
  pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
    self.entries.keys()
  }
}

impl<R: ListRow> Default for ListCache<R> {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}

//! Owner of the current list-query state.

use tracing::debug;

use super::{decode_with, raw_from_url, QueryDefaults, QueryKey, QueryState, RawQuery};

pub type ListenerId = u64;

type Listener = Box<dyn FnMut(&QueryState) + Send>;

/// Single source of truth for the decoded list-query parameters.
///
/// Owned by the application shell and handed to consumers by reference.
/// Listeners fire only when an update changes the canonical key, so a URL
/// that merely reorders its filters does not notify anyone.
pub struct QueryStateStore {
  defaults: QueryDefaults,
  current: QueryState,
  key: QueryKey,
  listeners: Vec<(ListenerId, Listener)>,
  next_listener: ListenerId,
}

impl QueryStateStore {
  pub fn new(defaults: QueryDefaults) -> Self {
    let current = QueryState::from_defaults(&defaults);
    let key = current.to_key();
    Self {
      defaults,
      current,
      key,
      listeners: Vec::new(),
      next_listener: 0,
    }
  }

  pub fn current(&self) -> &QueryState {
    &self.current
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn defaults(&self) -> &QueryDefaults {
    &self.defaults
  }

  /// Decode `raw` and make it current. Returns whether the state changed.
  pub fn update(&mut self, raw: &RawQuery) -> bool {
    let next = decode_with(raw, &self.defaults);
    self.replace(next)
  }

  /// Decode a full URL (or bare query string) and make it current.
  pub fn update_from_url(&mut self, url: &str) -> bool {
    self.update(&raw_from_url(url))
  }

  /// Move to another page of the current filters.
  pub fn set_cursor(&mut self, cursor: Option<super::Cursor>) -> bool {
    let next = self.current.with_cursor(cursor);
    self.replace(next)
  }

  pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
  where
    F: FnMut(&QueryState) + Send + 'static,
  {
    let id = self.next_listener;
    self.next_listener += 1;
    self.listeners.push((id, Box::new(listener)));
    id
  }

  /// Returns false if `id` was not subscribed.
  pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
    let before = self.listeners.len();
    self.listeners.retain(|(listener_id, _)| *listener_id != id);
    self.listeners.len() != before
  }

  /// Return to the initial state and drop every listener.
  pub fn reset(&mut self) {
    self.current = QueryState::from_defaults(&self.defaults);
    self.key = self.current.to_key();
    self.listeners.clear();
  }

  fn replace(&mut self, next: QueryState) -> bool {
    let key = next.to_key();
    if key == self.key {
      return false;
    }

    debug!(key = %key, "Query state changed");
    self.current = next;
    self.key = key;
    for (_, listener) in &mut self.listeners {
      listener(&self.current);
    }
    true
  }
}

impl Default for QueryStateStore {
  fn default() -> Self {
    Self::new(QueryDefaults::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_state::SortField;
  use std::sync::{Arc, Mutex};

  fn recorder(store: &mut QueryStateStore) -> (ListenerId, Arc<Mutex<Vec<QueryState>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let id = store.subscribe(move |state| sink.lock().unwrap().push(state.clone()));
    (id, seen)
  }

  #[test]
  fn test_notifies_on_change() {
    let mut store = QueryStateStore::default();
    let (_, seen) = recorder(&mut store);

    assert!(store.update_from_url("?sort=freq&project=1"));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].sort, SortField::Freq);
  }

  #[test]
  fn test_equivalent_state_is_silent() {
    let mut store = QueryStateStore::default();
    store.update_from_url("?project=1&project=2&environment=a&environment=b");
    let (_, seen) = recorder(&mut store);

    assert!(!store.update_from_url("?environment=b&project=2&environment=a&project=1"));
    assert!(seen.lock().unwrap().is_empty());
  }

  #[test]
  fn test_defaults_are_silent() {
    let mut store = QueryStateStore::default();
    let (_, seen) = recorder(&mut store);

    // Explicit defaults and junk that falls back to defaults
    assert!(!store.update_from_url("?sort=date&cursor=not-a-number"));
    assert!(seen.lock().unwrap().is_empty());
  }

  #[test]
  fn test_unsubscribe() {
    let mut store = QueryStateStore::default();
    let (id, seen) = recorder(&mut store);

    assert!(store.unsubscribe(id));
    assert!(!store.unsubscribe(id));
    store.update_from_url("?sort=new");
    assert!(seen.lock().unwrap().is_empty());
  }

  #[test]
  fn test_set_cursor() {
    let mut store = QueryStateStore::default();
    let (_, seen) = recorder(&mut store);
    let cursor = crate::query_state::Cursor::parse("0:25:0");

    assert!(store.set_cursor(cursor.clone()));
    assert!(!store.set_cursor(cursor.clone()));
    assert_eq!(store.key().cursor(), cursor.as_ref());
    assert_eq!(seen.lock().unwrap().len(), 1);
  }

  #[test]
  fn test_reset() {
    let mut store = QueryStateStore::default();
    let (_, seen) = recorder(&mut store);
    store.update_from_url("?sort=new");

    store.reset();
    assert_eq!(store.current(), &QueryState::default());
    store.update_from_url("?sort=user");
    assert_eq!(seen.lock().unwrap().len(), 1);
  }
}

//! Core traits and types for the list cache.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::query_state::QueryKey;

/// Trait for rows that can be stored in a cached page.
///
/// The cache never interprets row contents; the id is only used to find
/// pages that contain a row touched by a mutation.
pub trait ListRow: Clone + Send + Sync + 'static {
  /// Unique identifier for this row (e.g., issue id)
  fn row_id(&self) -> &str;
}

/// One page of results as returned by a fetcher.
#[derive(Debug, Clone)]
pub struct Page<R> {
  pub rows: Vec<R>,
  /// Opaque cursor of the following page, if there are more results
  pub next_cursor: Option<String>,
  /// Opaque cursor of the preceding page, if any
  pub previous_cursor: Option<String>,
}

impl<R> Page<R> {
  pub fn new(rows: Vec<R>) -> Self {
    Self {
      rows,
      next_cursor: None,
      previous_cursor: None,
    }
  }
}

/// A cached page and its metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<R> {
  /// The key this page was fetched for
  pub key: QueryKey,
  /// Rows in server order, shared between every reader of the entry
  pub rows: Arc<Vec<R>>,
  pub next_cursor: Option<String>,
  pub previous_cursor: Option<String>,
  /// When the page was fetched
  pub fetched_at: DateTime<Utc>,
  /// Set by invalidation; the rows may no longer match the server
  pub stale: bool,
}

impl<R> CacheEntry<R> {
  pub fn new(key: QueryKey, page: Page<R>) -> Self {
    Self {
      key,
      rows: Arc::new(page.rows),
      next_cursor: page.next_cursor,
      previous_cursor: page.previous_cursor,
      fetched_at: Utc::now(),
      stale: false,
    }
  }

  /// Stale when flagged, or when older than `stale_after` (if set).
  pub fn is_stale(&self, stale_after: Option<Duration>) -> bool {
    if self.stale {
      return true;
    }
    match stale_after {
      Some(max_age) => Utc::now() - self.fetched_at > max_age,
      None => false,
    }
  }
}

impl<R: ListRow> CacheEntry<R> {
  pub fn contains_row(&self, id: &str) -> bool {
    self.rows.iter().any(|row| row.row_id() == id)
  }
}

/// Notifications published by the fetch coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// A page was fetched and stored
  Fetched { key: QueryKey, rows: usize },
  /// A fetch failed; nothing was stored
  Failed {
    key: QueryKey,
    error: crate::error::FetchError,
  },
  /// Entries were marked stale
  Invalidated { count: usize },
  /// An entry left the cache (capacity or last observer gone)
  Evicted { key: QueryKey },
  /// The whole cache was cleared
  Cleared,
}

/// Lifecycle of a single key, as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
  /// Nothing cached and nothing in flight
  Idle,
  /// A request is in flight
  Fetching,
  /// A fresh entry is cached
  Fulfilled,
  /// An entry is cached but stale; the next request refetches
  Stale,
  /// The last request failed and nothing fresh is cached
  Failed,
}

//! Consumer-side handle for loading list pages through the coordinator.
//!
//! Inspired by TanStack Query: the view owns a `ListQuery`, tells it which
//! key to show, and polls it from its event loop. Nothing is injected behind
//! the view's back.
//!
//! # Example
//!
//! ```ignore
//! let client = sentry_client.clone();
//! let mut list = ListQuery::new(coordinator.clone(), move |key| {
//!     let client = client.clone();
//!     async move { client.fetch_issues(&key).await }
//! });
//!
//! list.load(store.key().clone());
//!
//! // In event loop tick
//! if list.poll() {
//!     // State changed, re-render
//! }
//!
//! match list.state() {
//!     LoadState::Loading { previous } => render(previous.as_ref()),
//!     LoadState::Success(page) => render(Some(page)),
//!     LoadState::Error(e) => render_error(e),
//!     LoadState::Idle => {}
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{CacheEntry, FetchCoordinator, KeyObserver, KeyState, ListRow, Page};
use crate::error::FetchError;
use crate::query_state::QueryKey;

/// The state of the list being shown
#[derive(Debug, Clone)]
pub enum LoadState<R> {
  /// Nothing requested yet
  Idle,
  /// Fetching; `previous` holds the cached (stale) page for the key, if any
  Loading { previous: Option<CacheEntry<R>> },
  Success(CacheEntry<R>),
  Error(FetchError),
}

impl<R> LoadState<R> {
  pub fn is_loading(&self) -> bool {
    matches!(self, LoadState::Loading { .. })
  }

  pub fn is_success(&self) -> bool {
    matches!(self, LoadState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, LoadState::Error(_))
  }

  /// The page to display: the loaded one, or the stale one while loading.
  pub fn data(&self) -> Option<&CacheEntry<R>> {
    match self {
      LoadState::Success(entry) => Some(entry),
      LoadState::Loading { previous } => previous.as_ref(),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&FetchError> {
    match self {
      LoadState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type BoxFuture<R> = Pin<Box<dyn Future<Output = Result<Page<R>, FetchError>> + Send>>;

type FetcherFn<R> = Arc<dyn Fn(QueryKey) -> BoxFuture<R> + Send + Sync>;

type Outcome<R> = Result<CacheEntry<R>, FetchError>;

/// Loads pages for one view.
///
/// Every key the query has shown stays observed until the query is
/// dropped, so the view's pages remain cached while it is alive and are
/// released together when it goes away.
pub struct ListQuery<R: ListRow> {
  coordinator: FetchCoordinator<R>,
  fetcher: FetcherFn<R>,
  key: Option<QueryKey>,
  state: LoadState<R>,
  receiver: Option<mpsc::UnboundedReceiver<Outcome<R>>>,
  task: Option<JoinHandle<()>>,
  observers: HashMap<QueryKey, KeyObserver<R>>,
}

impl<R: ListRow> ListQuery<R> {
  pub fn new<F, Fut>(coordinator: FetchCoordinator<R>, fetcher: F) -> Self
  where
    F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Page<R>, FetchError>> + Send + 'static,
  {
    Self {
      coordinator,
      fetcher: Arc::new(move |key| -> BoxFuture<R> { Box::pin(fetcher(key)) }),
      key: None,
      state: LoadState::Idle,
      receiver: None,
      task: None,
      observers: HashMap::new(),
    }
  }

  pub fn state(&self) -> &LoadState<R> {
    &self.state
  }

  pub fn key(&self) -> Option<&QueryKey> {
    self.key.as_ref()
  }

  pub fn data(&self) -> Option<&CacheEntry<R>> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn error(&self) -> Option<&FetchError> {
    self.state.error()
  }

  /// Show `key`.
  ///
  /// No-op if `key` is already loading, or already loaded and still fresh.
  /// A load for a different key replaces (and cancels) the previous one.
  pub fn load(&mut self, key: QueryKey) {
    if self.key.as_ref() == Some(&key) {
      let fresh = self.state.is_success() && self.coordinator.state(&key) == KeyState::Fulfilled;
      if self.state.is_loading() || fresh {
        return;
      }
    }
    self.start_fetch(key);
  }

  /// Force a network round-trip for the current key.
  pub fn refetch(&mut self) {
    if let Some(key) = self.key.clone() {
      self.coordinator.invalidate(|k| *k == key);
      self.start_fetch(key);
    }
  }

  /// Poll for the result of a pending load without blocking.
  ///
  /// Returns `true` if the state changed. Call this in the event loop tick.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(outcome) => {
        self.apply(outcome);
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.apply(Err(FetchError::Cancelled));
        true
      }
    }
  }

  /// Wait for the pending load to settle. Returns `false` if nothing was
  /// pending.
  pub async fn settled(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };
    let outcome = receiver
      .recv()
      .await
      .unwrap_or(Err(FetchError::Cancelled));
    self.apply(outcome);
    true
  }

  fn apply(&mut self, outcome: Outcome<R>) {
    self.receiver = None;
    self.task = None;
    self.state = match outcome {
      Ok(entry) => LoadState::Success(entry),
      Err(error) => LoadState::Error(error),
    };
  }

  fn start_fetch(&mut self, key: QueryKey) {
    // Aborting the task drops its PendingFetch, which cancels only our waiter
    if let Some(task) = self.task.take() {
      task.abort();
    }

    if !self.observers.contains_key(&key) {
      let observer = self.coordinator.observe(key.clone());
      self.observers.insert(key.clone(), observer);
    }

    let fetcher = Arc::clone(&self.fetcher);
    let pending = self.coordinator.request(key.clone(), move |k| fetcher(k));

    let (tx, rx) = mpsc::unbounded_channel();
    self.task = Some(tokio::spawn(async move {
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(pending.await);
    }));
    self.receiver = Some(rx);
    self.state = LoadState::Loading {
      previous: self.coordinator.peek(&key),
    };
    self.key = Some(key);
  }
}

impl<R: ListRow> Drop for ListQuery<R> {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

impl<R: ListRow + std::fmt::Debug> std::fmt::Debug for ListQuery<R> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ListQuery")
      .field("key", &self.key)
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ListCache;
  use crate::query_state::QueryState;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[derive(Debug, Clone, PartialEq)]
  struct Row(String);

  impl ListRow for Row {
    fn row_id(&self) -> &str {
      &self.0
    }
  }

  fn key(project: u64) -> QueryKey {
    QueryState {
      projects: vec![project],
      ..QueryState::default()
    }
    .to_key()
  }

  /// Query whose fetcher returns one row named after the call number.
  fn counting_query(
    coordinator: &FetchCoordinator<Row>,
    delay_ms: u64,
  ) -> (ListQuery<Row>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let query = ListQuery::new(coordinator.clone(), move |_key| {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(Page::new(vec![Row(format!("call-{}", n))]))
      }
    });
    (query, calls)
  }

  fn shown(query: &ListQuery<Row>) -> Option<String> {
    query.data().map(|entry| entry.rows[0].0.clone())
  }

  #[tokio::test]
  async fn test_load_success() {
    let coordinator = FetchCoordinator::new(ListCache::new(8));
    let (mut query, _) = counting_query(&coordinator, 0);

    assert!(matches!(query.state(), LoadState::Idle));
    query.load(key(1));
    assert!(query.is_loading());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(query.poll());
    assert!(query.state().is_success());
    assert_eq!(shown(&query), Some("call-0".into()));
  }

  #[tokio::test]
  async fn test_load_error() {
    let coordinator = FetchCoordinator::<Row>::new(ListCache::new(8));
    let mut query = ListQuery::new(coordinator, |_key| async {
      Err(FetchError::Transport("connection refused".into()))
    });

    query.load(key(1));
    assert!(query.settled().await);
    assert!(query.state().is_error());
    assert_eq!(
      query.error(),
      Some(&FetchError::Transport("connection refused".into()))
    );
  }

  #[tokio::test]
  async fn test_load_while_loading_is_noop() {
    let coordinator = FetchCoordinator::new(ListCache::new(8));
    let (mut query, calls) = counting_query(&coordinator, 20);

    query.load(key(1));
    query.load(key(1));
    assert!(query.settled().await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Loaded and fresh: still a no-op
    query.load(key(1));
    assert!(!query.is_loading());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_two_views_share_one_fetch() {
    let coordinator = FetchCoordinator::new(ListCache::new(8));
    let (mut first, calls) = counting_query(&coordinator, 10);
    let (mut second, other_calls) = counting_query(&coordinator, 10);

    first.load(key(1));
    second.load(key(1));
    first.settled().await;
    second.settled().await;

    assert_eq!(calls.load(Ordering::SeqCst) + other_calls.load(Ordering::SeqCst), 1);
    assert_eq!(shown(&first), shown(&second));
  }

  #[tokio::test]
  async fn test_switching_keys_cancels_previous() {
    let coordinator = FetchCoordinator::new(ListCache::new(8));
    let (mut query, _) = counting_query(&coordinator, 30);

    query.load(key(1));
    query.load(key(2));
    assert_eq!(query.key(), Some(&key(2)));

    // Give the aborted task a chance to drop its waiter
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(coordinator.state(&key(1)), KeyState::Idle);

    assert!(query.settled().await);
    assert_eq!(shown(&query), Some("call-1".into()));
  }

  #[tokio::test]
  async fn test_refetch_shows_stale_page_while_loading() {
    let coordinator = FetchCoordinator::new(ListCache::new(8));
    let (mut query, calls) = counting_query(&coordinator, 5);

    query.load(key(1));
    query.settled().await;
    query.refetch();

    assert!(query.is_loading());
    assert_eq!(shown(&query), Some("call-0".into()));
    assert!(query.data().unwrap().stale);

    query.settled().await;
    assert_eq!(shown(&query), Some("call-1".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_drop_releases_pages() {
    let coordinator = FetchCoordinator::new(ListCache::new(8));
    let (mut query, _) = counting_query(&coordinator, 0);

    query.load(key(1));
    query.settled().await;
    query.load(key(2));
    query.settled().await;
    assert_eq!(coordinator.cached_len(), 2);

    drop(query);
    assert_eq!(coordinator.cached_len(), 0);
  }
}

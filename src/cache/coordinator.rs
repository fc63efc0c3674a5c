//! Fetch coordinator that orchestrates the list cache and network fetching.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::FutureExt;
use indexmap::IndexSet;
use tokio::sync::{broadcast, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use super::list_cache::ListCache;
use super::traits::{CacheEntry, CacheEvent, KeyState, ListRow, Page};
use crate::error::FetchError;
use crate::query_state::QueryKey;

/// Identifies one caller waiting on a key.
pub type WaiterId = u64;

type Reply<R> = oneshot::Sender<Result<CacheEntry<R>, FetchError>>;

const EVENT_CAPACITY: usize = 64;

const PANIC_MESSAGE: &str = "list fetcher panicked";

/// An in-flight fetch. At most one exists per key.
struct PendingRequest<R> {
  generation: u64,
  waiters: HashMap<WaiterId, Reply<R>>,
  abort: Option<AbortHandle>,
}

struct Inner<R> {
  cache: ListCache<R>,
  pending: HashMap<QueryKey, PendingRequest<R>>,
  /// Keys whose last fetch failed, oldest first; bounded by the cache capacity
  failed: IndexSet<QueryKey>,
  observers: HashMap<QueryKey, usize>,
  next_generation: u64,
  next_waiter: WaiterId,
}

struct Shared<R> {
  inner: Mutex<Inner<R>>,
  events: broadcast::Sender<CacheEvent>,
}

/// The only component that performs list I/O.
///
/// Serves fresh pages from the cache, coalesces concurrent requests for the
/// same key into a single fetch, and writes results back. The lock is never
/// held across an `.await`.
pub struct FetchCoordinator<R> {
  shared: Arc<Shared<R>>,
}

impl<R: ListRow> FetchCoordinator<R> {
  pub fn new(cache: ListCache<R>) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      shared: Arc::new(Shared {
        inner: Mutex::new(Inner {
          cache,
          pending: HashMap::new(),
          failed: IndexSet::new(),
          observers: HashMap::new(),
          next_generation: 0,
          next_waiter: 0,
        }),
        events,
      }),
    }
  }

  /// Request the page for `key`.
  ///
  /// 1. Fresh cache entry: resolves on first poll, `fetcher` is not called
  /// 2. Request already in flight: joins it, `fetcher` is not called
  /// 3. Otherwise: calls `fetcher(key)` and runs it on a spawned task
  ///
  /// Must be called from within a tokio runtime. Dropping the returned
  /// future before it resolves cancels this caller only.
  pub fn request<F, Fut>(&self, key: QueryKey, fetcher: F) -> PendingFetch<R>
  where
    F: FnOnce(QueryKey) -> Fut,
    Fut: Future<Output = Result<Page<R>, FetchError>> + Send + 'static,
  {
    let (reply, rx) = oneshot::channel();
    let mut inner = self.shared.lock();
    let waiter = inner.next_waiter;
    inner.next_waiter += 1;

    let fetch = PendingFetch {
      key: key.clone(),
      waiter,
      rx,
      shared: Arc::downgrade(&self.shared),
      settled: false,
    };

    let stale_after = inner.cache.stale_after();
    if let Some(entry) = inner.cache.get(&key) {
      if !entry.is_stale(stale_after) {
        debug!(key = %key, "Serving list page from cache");
        let _ = reply.send(Ok(entry.clone()));
        return fetch;
      }
    }

    if let Some(pending) = inner.pending.get_mut(&key) {
      debug!(key = %key, generation = pending.generation, "Joining in-flight request");
      pending.waiters.insert(waiter, reply);
      return fetch;
    }

    inner.next_generation += 1;
    let generation = inner.next_generation;
    inner.failed.shift_remove(&key);
    inner.pending.insert(
      key.clone(),
      PendingRequest {
        generation,
        waiters: HashMap::from([(waiter, reply)]),
        abort: None,
      },
    );
    drop(inner);

    info!(key = %key, digest = %key.digest(), generation, "Fetching list page");
    // A panic in the fetcher settles the request as a transport failure
    let future = match panic::catch_unwind(AssertUnwindSafe(|| fetcher(key.clone()))) {
      Ok(future) => future,
      Err(_) => {
        self
          .shared
          .settle(&key, generation, Err(FetchError::Transport(PANIC_MESSAGE.into())));
        return fetch;
      }
    };
    let shared = Arc::clone(&self.shared);
    let task_key = key.clone();
    let handle = tokio::spawn(async move {
      let result = AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(FetchError::Transport(PANIC_MESSAGE.into())));
      shared.settle(&task_key, generation, result);
    });

    let mut inner = self.shared.lock();
    match inner.pending.get_mut(&key) {
      Some(pending) if pending.generation == generation => {
        pending.abort = Some(handle.abort_handle());
      }
      // Every waiter left before the task was registered
      _ => handle.abort(),
    }

    fetch
  }

  /// Cancel one waiter. Its future resolves with [`FetchError::Cancelled`];
  /// other waiters on the same key are unaffected. When the last waiter
  /// leaves, the fetch task is aborted and the key goes back to idle.
  ///
  /// Returns false if the waiter was not waiting on `key`.
  pub fn cancel(&self, key: &QueryKey, waiter: WaiterId) -> bool {
    self.shared.cancel_waiter(key, waiter, true)
  }

  /// Cancel every waiter on `key`. Returns how many were cancelled.
  pub fn cancel_all(&self, key: &QueryKey) -> usize {
    let pending = self.shared.lock().pending.remove(key);
    match pending {
      Some(pending) => {
        if let Some(abort) = pending.abort {
          abort.abort();
        }
        let count = pending.waiters.len();
        for (_, reply) in pending.waiters {
          let _ = reply.send(Err(FetchError::Cancelled));
        }
        info!(key = %key, waiters = count, "Cancelled list fetch");
        count
      }
      None => 0,
    }
  }

  /// Cached entry for `key`, fresh or stale, without touching recency.
  pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry<R>> {
    self.shared.lock().cache.peek(key).cloned()
  }

  pub fn state(&self, key: &QueryKey) -> KeyState {
    let inner = self.shared.lock();
    if inner.pending.contains_key(key) {
      return KeyState::Fetching;
    }
    if inner.failed.contains(key) {
      return KeyState::Failed;
    }
    match inner.cache.peek(key) {
      Some(entry) if inner.cache.is_fresh(entry) => KeyState::Fulfilled,
      Some(_) => KeyState::Stale,
      None => KeyState::Idle,
    }
  }

  /// Mark matching entries stale. They stay readable through [`peek`](Self::peek).
  pub fn invalidate<P>(&self, predicate: P) -> usize
  where
    P: FnMut(&QueryKey) -> bool,
  {
    let count = self.shared.lock().cache.invalidate(predicate);
    info!(count, "Invalidated cached list pages");
    self.shared.emit(CacheEvent::Invalidated { count });
    count
  }

  /// Mark every entry containing one of the given row ids stale.
  pub fn invalidate_rows(&self, ids: &[String]) -> usize {
    let count = self.shared.lock().cache.invalidate_rows(ids);
    info!(count, "Invalidated cached list pages by row");
    self.shared.emit(CacheEvent::Invalidated { count });
    count
  }

  /// Drop every cached entry. In-flight requests keep running.
  pub fn evict_all(&self) {
    let mut inner = self.shared.lock();
    inner.cache.evict_all();
    inner.failed.clear();
    drop(inner);
    info!("Cleared list cache");
    self.shared.emit(CacheEvent::Cleared);
  }

  /// Cancel everything in flight and clear the cache (sign-out, org switch).
  pub fn reset(&self) {
    let keys: Vec<QueryKey> = self.shared.lock().pending.keys().cloned().collect();
    for key in &keys {
      self.cancel_all(key);
    }
    self.evict_all();
  }

  /// Register interest in `key`. The cached entry is evicted once the last
  /// observer for the key is dropped.
  pub fn observe(&self, key: QueryKey) -> KeyObserver<R> {
    *self.shared.lock().observers.entry(key.clone()).or_insert(0) += 1;
    KeyObserver {
      key,
      shared: Arc::downgrade(&self.shared),
    }
  }

  pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
    self.shared.events.subscribe()
  }

  pub fn cached_len(&self) -> usize {
    self.shared.lock().cache.len()
  }

  pub fn pending_len(&self) -> usize {
    self.shared.lock().pending.len()
  }
}

impl<R> Clone for FetchCoordinator<R> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<R: ListRow> Shared<R> {
  fn lock(&self) -> MutexGuard<'_, Inner<R>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn emit(&self, event: CacheEvent) {
    // No receivers is fine
    let _ = self.events.send(event);
  }

  /// Apply a finished fetch. Results whose generation no longer matches the
  /// pending request were superseded and are dropped.
  fn settle(&self, key: &QueryKey, generation: u64, result: Result<Page<R>, FetchError>) {
    let mut inner = self.lock();
    let pending = match inner.pending.entry(key.clone()) {
      Entry::Occupied(slot) if slot.get().generation == generation => slot.remove(),
      _ => {
        trace!(key = %key, generation, "Discarding superseded response");
        return;
      }
    };

    match result {
      Ok(page) => {
        let entry = CacheEntry::new(key.clone(), page);
        let rows = entry.rows.len();
        let evicted = inner.cache.put(entry.clone());
        inner.failed.shift_remove(key);
        for evicted_key in &evicted {
          inner.failed.shift_remove(evicted_key);
        }
        drop(inner);

        info!(key = %key, generation, rows, waiters = pending.waiters.len(), "Stored list page");
        for (_, reply) in pending.waiters {
          let _ = reply.send(Ok(entry.clone()));
        }
        self.emit(CacheEvent::Fetched {
          key: key.clone(),
          rows,
        });
        for key in evicted {
          debug!(key = %key, "Evicted least recently used page");
          self.emit(CacheEvent::Evicted { key });
        }
      }
      Err(error) => {
        inner.failed.shift_remove(key);
        inner.failed.insert(key.clone());
        while inner.failed.len() > inner.cache.capacity() {
          inner.failed.shift_remove_index(0);
        }
        drop(inner);

        warn!(key = %key, generation, error = %error, "List fetch failed");
        for (_, reply) in pending.waiters {
          let _ = reply.send(Err(error.clone()));
        }
        self.emit(CacheEvent::Failed {
          key: key.clone(),
          error,
        });
      }
    }
  }

  fn cancel_waiter(&self, key: &QueryKey, waiter: WaiterId, notify: bool) -> bool {
    let mut inner = self.lock();
    let pending = match inner.pending.get_mut(key) {
      Some(pending) => pending,
      None => return false,
    };
    let reply = match pending.waiters.remove(&waiter) {
      Some(reply) => reply,
      None => return false,
    };
    if notify {
      let _ = reply.send(Err(FetchError::Cancelled));
    }
    debug!(key = %key, waiter, "Cancelled waiter");

    if pending.waiters.is_empty() {
      if let Some(pending) = inner.pending.remove(key) {
        if let Some(abort) = pending.abort {
          abort.abort();
        }
      }
      info!(key = %key, "Cancelled list fetch with no remaining waiters");
    }
    true
  }

  fn release(&self, key: &QueryKey) {
    let mut inner = self.lock();
    let remaining = match inner.observers.get_mut(key) {
      Some(count) => {
        *count = count.saturating_sub(1);
        *count
      }
      None => return,
    };
    if remaining > 0 {
      return;
    }

    inner.observers.remove(key);
    inner.failed.shift_remove(key);
    let removed = inner.cache.remove(key).is_some();
    drop(inner);

    if removed {
      debug!(key = %key, "Evicted page with no remaining observers");
      self.emit(CacheEvent::Evicted { key: key.clone() });
    }
  }
}

/// Future returned by [`FetchCoordinator::request`].
pub struct PendingFetch<R: ListRow> {
  key: QueryKey,
  waiter: WaiterId,
  rx: oneshot::Receiver<Result<CacheEntry<R>, FetchError>>,
  shared: Weak<Shared<R>>,
  settled: bool,
}

impl<R: ListRow> PendingFetch<R> {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn waiter(&self) -> WaiterId {
    self.waiter
  }

  /// Stop waiting. Same as dropping the future.
  pub fn cancel(self) {
    drop(self);
  }
}

impl<R: ListRow> Future for PendingFetch<R> {
  type Output = Result<CacheEntry<R>, FetchError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match Pin::new(&mut self.rx).poll(cx) {
      Poll::Ready(result) => {
        self.settled = true;
        // Sender dropped without replying: the request was torn down
        Poll::Ready(result.unwrap_or_else(|_| Err(FetchError::Cancelled)))
      }
      Poll::Pending => Poll::Pending,
    }
  }
}

impl<R: ListRow> Drop for PendingFetch<R> {
  fn drop(&mut self) {
    if self.settled {
      return;
    }
    if let Some(shared) = self.shared.upgrade() {
      shared.cancel_waiter(&self.key, self.waiter, false);
    }
  }
}

/// Keeps a key's cache entry alive while held. See [`FetchCoordinator::observe`].
pub struct KeyObserver<R: ListRow> {
  key: QueryKey,
  shared: Weak<Shared<R>>,
}

impl<R: ListRow> KeyObserver<R> {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }
}

impl<R: ListRow> Drop for KeyObserver<R> {
  fn drop(&mut self) {
    if let Some(shared) = self.shared.upgrade() {
      shared.release(&self.key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_state::QueryState;
  use futures::future::BoxFuture;
  use futures::FutureExt;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[derive(Debug, Clone, PartialEq)]
  struct Row(String);

  impl ListRow for Row {
    fn row_id(&self) -> &str {
      &self.0
    }
  }

  type Fetcher = Box<dyn FnOnce(QueryKey) -> BoxFuture<'static, Result<Page<Row>, FetchError>>>;

  fn key(project: u64) -> QueryKey {
    QueryState {
      projects: vec![project],
      ..QueryState::default()
    }
    .to_key()
  }

  fn fetcher(calls: &Arc<AtomicUsize>, rows: &'static [&'static str], delay_ms: u64) -> Fetcher {
    let calls = Arc::clone(calls);
    Box::new(move |_key| {
      calls.fetch_add(1, Ordering::SeqCst);
      async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(Page::new(rows.iter().map(|r| Row(r.to_string())).collect()))
      }
      .boxed()
    })
  }

  fn failing(calls: &Arc<AtomicUsize>) -> Fetcher {
    let calls = Arc::clone(calls);
    Box::new(move |_key| {
      calls.fetch_add(1, Ordering::SeqCst);
      async move {
        Err(FetchError::Status {
          status: 500,
          message: "boom".into(),
        })
      }
      .boxed()
    })
  }

  fn coordinator() -> FetchCoordinator<Row> {
    FetchCoordinator::new(ListCache::new(20))
  }

  fn first_row(entry: &CacheEntry<Row>) -> &str {
    &entry.rows[0].0
  }

  #[tokio::test]
  async fn test_concurrent_requests_coalesce() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key(1);

    let a = coordinator.request(k.clone(), fetcher(&calls, &["a"], 10));
    let b = coordinator.request(k.clone(), fetcher(&calls, &["b"], 10));
    let c = coordinator.request(k.clone(), fetcher(&calls, &["c"], 10));
    assert_eq!(coordinator.state(&k), KeyState::Fetching);

    let (a, b, c) = tokio::join!(a, b, c);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for entry in [a.unwrap(), b.unwrap(), c.unwrap()] {
      assert_eq!(first_row(&entry), "a");
    }
    assert_eq!(coordinator.pending_len(), 0);
    assert_eq!(coordinator.state(&k), KeyState::Fulfilled);
  }

  #[tokio::test]
  async fn test_cache_hit_skips_fetcher() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key(1);

    coordinator
      .request(k.clone(), fetcher(&calls, &["a"], 0))
      .await
      .unwrap();

    // Resolves on first poll, no task involved
    let hit = coordinator
      .request(k.clone(), fetcher(&calls, &["b"], 0))
      .now_or_never()
      .expect("cache hit resolves immediately")
      .unwrap();
    assert_eq!(first_row(&hit), "a");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_distinct_keys_fetch_separately() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));

    let a = coordinator.request(key(1), fetcher(&calls, &["a"], 5));
    let b = coordinator.request(key(2), fetcher(&calls, &["b"], 5));
    let (a, b) = tokio::join!(a, b);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(first_row(&a.unwrap()), "a");
    assert_eq!(first_row(&b.unwrap()), "b");
    assert_eq!(coordinator.cached_len(), 2);
  }

  #[tokio::test]
  async fn test_failure_rejects_all_and_caches_nothing() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key(1);

    let a = coordinator.request(k.clone(), failing(&calls));
    let b = coordinator.request(k.clone(), failing(&calls));
    let (a, b) = tokio::join!(a, b);

    assert!(matches!(a, Err(FetchError::Status { status: 500, .. })));
    assert_eq!(a.unwrap_err(), b.unwrap_err());
    assert!(coordinator.peek(&k).is_none());
    assert_eq!(coordinator.state(&k), KeyState::Failed);

    // Retry starts from scratch
    let retried = coordinator
      .request(k.clone(), fetcher(&calls, &["a"], 0))
      .await
      .unwrap();
    assert_eq!(first_row(&retried), "a");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(coordinator.state(&k), KeyState::Fulfilled);
  }

  #[tokio::test]
  async fn test_cancel_is_per_waiter() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key(1);

    let a = coordinator.request(k.clone(), fetcher(&calls, &["a"], 10));
    let b = coordinator.request(k.clone(), fetcher(&calls, &["b"], 10));

    assert!(coordinator.cancel(&k, a.waiter()));
    assert!(!coordinator.cancel(&k, a.waiter()));

    assert_eq!(a.await.unwrap_err(), FetchError::Cancelled);
    let b = b.await.unwrap();
    assert_eq!(first_row(&b), "a");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_dropping_every_waiter_goes_idle() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key(1);

    let a = coordinator.request(k.clone(), fetcher(&calls, &["a"], 10));
    let b = coordinator.request(k.clone(), fetcher(&calls, &["b"], 10));
    drop(a);
    assert_eq!(coordinator.state(&k), KeyState::Fetching);
    b.cancel();

    assert_eq!(coordinator.state(&k), KeyState::Idle);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(coordinator.peek(&k).is_none());
  }

  #[tokio::test]
  async fn test_cancel_all() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key(1);

    let a = coordinator.request(k.clone(), fetcher(&calls, &["a"], 10));
    let b = coordinator.request(k.clone(), fetcher(&calls, &["b"], 10));
    assert_eq!(coordinator.cancel_all(&k), 2);

    assert_eq!(a.await.unwrap_err(), FetchError::Cancelled);
    assert_eq!(b.await.unwrap_err(), FetchError::Cancelled);
    assert_eq!(coordinator.state(&k), KeyState::Idle);
  }

  #[tokio::test]
  async fn test_late_cancelled_response_is_discarded() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key(1);

    let first = coordinator.request(k.clone(), fetcher(&calls, &["d1"], 40));
    first.cancel();

    let second = coordinator
      .request(k.clone(), fetcher(&calls, &["d2"], 5))
      .await
      .unwrap();
    assert_eq!(first_row(&second), "d2");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(first_row(&coordinator.peek(&k).unwrap()), "d2");
  }

  #[tokio::test]
  async fn test_superseded_generation_is_ignored() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key(1);

    // Generation 1, cancelled
    coordinator
      .request(k.clone(), fetcher(&calls, &["d1"], 40))
      .cancel();

    // Generation 2 in flight; a late generation-1 result must not land
    let second = coordinator.request(k.clone(), fetcher(&calls, &["d2"], 10));
    let late = Ok(Page::new(vec![Row("d1".into())]));
    coordinator.shared.settle(&k, 1, late);
    assert!(coordinator.peek(&k).is_none());
    assert_eq!(coordinator.state(&k), KeyState::Fetching);

    assert_eq!(first_row(&second.await.unwrap()), "d2");

    // And not after generation 2 settled either
    let late = Ok(Page::new(vec![Row("d1".into())]));
    coordinator.shared.settle(&k, 1, late);
    assert_eq!(first_row(&coordinator.peek(&k).unwrap()), "d2");
  }

  #[tokio::test]
  async fn test_invalidate_then_refetch() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key(1);

    coordinator
      .request(k.clone(), fetcher(&calls, &["old"], 0))
      .await
      .unwrap();
    assert_eq!(coordinator.invalidate(|_| true), 1);
    assert_eq!(coordinator.state(&k), KeyState::Stale);

    // Stale data stays readable while the refresh runs
    let refresh = coordinator.request(k.clone(), fetcher(&calls, &["new"], 10));
    let shown = coordinator.peek(&k).unwrap();
    assert!(shown.stale);
    assert_eq!(first_row(&shown), "old");

    assert_eq!(first_row(&refresh.await.unwrap()), "new");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!coordinator.peek(&k).unwrap().stale);
  }

  #[tokio::test]
  async fn test_invalidate_rows() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));

    coordinator
      .request(key(1), fetcher(&calls, &["a", "b"], 0))
      .await
      .unwrap();
    coordinator
      .request(key(2), fetcher(&calls, &["c"], 0))
      .await
      .unwrap();

    assert_eq!(coordinator.invalidate_rows(&["b".to_string()]), 1);
    assert_eq!(coordinator.state(&key(1)), KeyState::Stale);
    assert_eq!(coordinator.state(&key(2)), KeyState::Fulfilled);
  }

  #[tokio::test]
  async fn test_last_observer_evicts() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key(1);
    let mut events = coordinator.subscribe_events();

    let first = coordinator.observe(k.clone());
    let second = coordinator.observe(k.clone());
    coordinator
      .request(k.clone(), fetcher(&calls, &["a"], 0))
      .await
      .unwrap();

    drop(first);
    assert!(coordinator.peek(&k).is_some());
    drop(second);
    assert!(coordinator.peek(&k).is_none());

    assert!(matches!(events.recv().await, Ok(CacheEvent::Fetched { rows: 1, .. })));
    assert_eq!(events.recv().await.unwrap(), CacheEvent::Evicted { key: k });
  }

  #[tokio::test]
  async fn test_capacity_eviction_event() {
    let coordinator = FetchCoordinator::new(ListCache::new(1));
    let calls = Arc::new(AtomicUsize::new(0));
    let mut events = coordinator.subscribe_events();

    coordinator
      .request(key(1), fetcher(&calls, &["a"], 0))
      .await
      .unwrap();
    coordinator
      .request(key(2), fetcher(&calls, &["b"], 0))
      .await
      .unwrap();

    assert_eq!(coordinator.cached_len(), 1);
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
      seen.push(event);
    }
    assert!(seen.contains(&CacheEvent::Evicted { key: key(1) }));
  }

  #[tokio::test]
  async fn test_reset_cancels_and_clears() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));

    coordinator
      .request(key(1), fetcher(&calls, &["a"], 0))
      .await
      .unwrap();
    let inflight = coordinator.request(key(2), fetcher(&calls, &["b"], 20));

    coordinator.reset();
    assert_eq!(inflight.await.unwrap_err(), FetchError::Cancelled);
    assert_eq!(coordinator.cached_len(), 0);
    assert_eq!(coordinator.pending_len(), 0);
  }

  #[tokio::test]
  async fn test_panicking_fetch_rejects_every_waiter() {
    let coordinator = coordinator();
    let k = key(1);

    let panicking: Fetcher = Box::new(|_key: QueryKey| {
      async {
        if true {
          panic!("fetch exploded");
        }
        Ok::<_, FetchError>(Page::<Row>::new(Vec::new()))
      }
      .boxed()
    });
    let a = coordinator.request(k.clone(), panicking);
    let b = coordinator.request(k.clone(), failing(&Arc::new(AtomicUsize::new(0))));

    let settled = tokio::time::timeout(Duration::from_secs(1), async { tokio::join!(a, b) }).await;
    let (a, b) = settled.expect("waiters settle after a panic");
    assert!(matches!(a, Err(FetchError::Transport(_))));
    assert_eq!(a.unwrap_err(), b.unwrap_err());
    assert_eq!(coordinator.pending_len(), 0);
    assert_eq!(coordinator.state(&k), KeyState::Failed);

    // The key is usable again
    let calls = Arc::new(AtomicUsize::new(0));
    let entry = coordinator
      .request(k.clone(), fetcher(&calls, &["a"], 0))
      .await
      .unwrap();
    assert_eq!(first_row(&entry), "a");
  }

  #[tokio::test]
  async fn test_fetcher_panicking_before_its_future_rejects() {
    let coordinator = coordinator();
    let k = key(1);

    let panicking: Fetcher =
      Box::new(|_key: QueryKey| -> BoxFuture<'static, Result<Page<Row>, FetchError>> {
        panic!("no future for you")
      });
    let result = coordinator.request(k.clone(), panicking).await;

    assert!(matches!(result, Err(FetchError::Transport(_))));
    assert_eq!(coordinator.pending_len(), 0);
  }

  #[tokio::test]
  async fn test_failed_keys_are_bounded() {
    let coordinator = FetchCoordinator::new(ListCache::new(2));
    let calls = Arc::new(AtomicUsize::new(0));

    for project in 1..=3 {
      let _ = coordinator.request(key(project), failing(&calls)).await;
    }

    assert_eq!(coordinator.state(&key(1)), KeyState::Idle);
    assert_eq!(coordinator.state(&key(2)), KeyState::Failed);
    assert_eq!(coordinator.state(&key(3)), KeyState::Failed);
  }

  #[tokio::test]
  async fn test_failure_forgotten_with_last_observer() {
    let coordinator = coordinator();
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key(1);

    let observer = coordinator.observe(k.clone());
    let _ = coordinator.request(k.clone(), failing(&calls)).await;
    assert_eq!(coordinator.state(&k), KeyState::Failed);

    drop(observer);
    assert_eq!(coordinator.state(&k), KeyState::Idle);
  }
}

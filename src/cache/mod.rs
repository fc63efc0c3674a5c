//! In-memory list caching with request coalescing.
//!
//! This module provides a backend-agnostic layer that:
//! - Caches result pages keyed by a canonical [`QueryKey`](crate::query_state::QueryKey)
//! - Bounds the cache with least-recently-used eviction
//! - Marks pages stale on invalidation while keeping them readable
//! - Coalesces concurrent requests for one key into a single fetch

mod coordinator;
mod list_cache;
mod traits;

pub use coordinator::{FetchCoordinator, KeyObserver, PendingFetch, WaiterId};
pub use list_cache::{ListCache, DEFAULT_CAPACITY};
pub use traits::{CacheEntry, CacheEvent, KeyState, ListRow, Page};

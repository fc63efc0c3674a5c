//! List caching and query-state sync for Sentry issue lists.
//!
//! [`query_state`] decodes list URLs into canonical [`query_state::QueryKey`]s,
//! [`cache`] stores fetched pages and coalesces fetches per key, and
//! [`list_query`] is the handle a view uses to show one list.

pub mod cache;
pub mod config;
pub mod error;
pub mod format;
pub mod list_query;
pub mod logging;
pub mod query_state;
pub mod sentry;

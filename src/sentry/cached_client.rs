//! Sentry client whose list reads go through the fetch coordinator.

use color_eyre::Result;
use tracing::info;

use crate::cache::{CacheEntry, FetchCoordinator};
use crate::config::Config;
use crate::list_query::ListQuery;
use crate::query_state::QueryKey;

use super::client::SentryClient;
use super::types::{IssueStatus, IssueSummary};

/// Sentry client with page caching and request coalescing.
///
/// Clones share one cache, so every view built from the same client sees
/// the same pages.
#[derive(Clone)]
pub struct CachedSentryClient {
  inner: SentryClient,
  coordinator: FetchCoordinator<IssueSummary>,
}

impl CachedSentryClient {
  pub fn new(config: &Config) -> Result<Self> {
    let inner = SentryClient::new(config)?;
    Ok(Self::from_parts(inner, FetchCoordinator::new(config.cache.build()?)))
  }

  pub fn from_parts(inner: SentryClient, coordinator: FetchCoordinator<IssueSummary>) -> Self {
    Self { inner, coordinator }
  }

  pub fn coordinator(&self) -> &FetchCoordinator<IssueSummary> {
    &self.coordinator
  }

  /// One page of issues, from cache when fresh.
  pub async fn issues(&self, key: &QueryKey) -> Result<CacheEntry<IssueSummary>> {
    let entry = self
      .coordinator
      .request(key.clone(), |key| {
        let inner = self.inner.clone();
        async move { inner.fetch_issues(&key).await }
      })
      .await?;

    Ok(entry)
  }

  /// A view-side handle that loads pages through this client.
  pub fn list_query(&self) -> ListQuery<IssueSummary> {
    let inner = self.inner.clone();
    ListQuery::new(self.coordinator.clone(), move |key| {
      let inner = inner.clone();
      async move { inner.fetch_issues(&key).await }
    })
  }

  /// Change the status of `ids` and mark affected pages stale.
  pub async fn update_status(
    &self,
    project: Option<u64>,
    ids: &[String],
    status: IssueStatus,
  ) -> Result<usize> {
    self.inner.bulk_update(project, ids, status).await?;
    Ok(self.invalidate_after_mutation(project))
  }

  /// A status change moves issues between lists, so every page that could
  /// list the project goes stale, not only pages holding the changed rows.
  /// Without a project that is every page of the organization.
  pub fn invalidate_after_mutation(&self, project: Option<u64>) -> usize {
    let invalidated = match project {
      Some(project) => self.coordinator.invalidate(|key| key.touches_project(project)),
      None => self.coordinator.invalidate(|_| true),
    };
    info!(invalidated, ?project, "Invalidated pages after status change");
    invalidated
  }
}

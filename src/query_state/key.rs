//! Canonical cache keys for list queries.

use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::{Cursor, QueryState, TimeRange};

/// Immutable, order-independent serialization of a [`QueryState`].
///
/// Project and environment lists are sorted and de-duplicated before
/// serialization, so states built with the same members in a different
/// order produce equal keys. Equality and hashing only look at the
/// canonical string.
#[derive(Clone)]
pub struct QueryKey {
  canonical: Arc<str>,
  state: Arc<QueryState>,
}

impl QueryKey {
  pub fn from_state(state: &QueryState) -> Self {
    let mut normalized = state.clone();
    normalized.query = normalized.query.trim().to_string();
    normalized.projects.sort_unstable();
    normalized.projects.dedup();
    normalized.environments.sort();
    normalized.environments.dedup();

    let canonical = canonicalize(&normalized);
    Self {
      canonical: canonical.into(),
      state: Arc::new(normalized),
    }
  }

  pub fn as_str(&self) -> &str {
    &self.canonical
  }

  /// The normalized state this key was built from
  pub fn state(&self) -> &QueryState {
    &self.state
  }

  pub fn projects(&self) -> &[u64] {
    &self.state.projects
  }

  pub fn environments(&self) -> &[String] {
    &self.state.environments
  }

  pub fn cursor(&self) -> Option<&Cursor> {
    self.state.cursor.as_ref()
  }

  /// Whether rows of `project` may appear under this key. An empty project
  /// filter means every project.
  pub fn touches_project(&self, project: u64) -> bool {
    self.state.projects.is_empty() || self.state.projects.binary_search(&project).is_ok()
  }

  /// Key for the same filters on another page
  pub fn with_cursor(&self, cursor: Option<Cursor>) -> Self {
    Self::from_state(&self.state.with_cursor(cursor))
  }

  /// Key for the first page of the same filters
  pub fn without_cursor(&self) -> Self {
    self.with_cursor(None)
  }

  /// SHA256 of the canonical string, for stable fixed-length log fields.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Fixed-order, form-encoded serialization; form encoding keeps user text
/// from colliding with the separators.
fn canonicalize(state: &QueryState) -> String {
  let mut out = url::form_urlencoded::Serializer::new(String::new());
  out.append_pair("query", &state.query);
  out.append_pair("sort", state.sort.as_str());
  out.append_pair("direction", state.direction.as_str());
  for env in &state.environments {
    out.append_pair("environment", env);
  }
  for project in &state.projects {
    out.append_pair("project", &project.to_string());
  }
  match &state.range {
    TimeRange::Relative(period) => {
      out.append_pair("period", &period.to_string());
    }
    TimeRange::Absolute { start, end } => {
      out.append_pair("start", &start.timestamp_millis().to_string());
      out.append_pair("end", &end.timestamp_millis().to_string());
    }
  }
  let cursor = state.cursor.as_ref().map(|c| c.to_string()).unwrap_or_default();
  out.append_pair("cursor", &cursor);
  out.finish()
}

impl PartialEq for QueryKey {
  fn eq(&self, other: &Self) -> bool {
    self.canonical == other.canonical
  }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.canonical.hash(state);
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

impl fmt::Debug for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("QueryKey").field(&self.canonical).finish()
  }
}

//! Serde-deserializable types matching Sentry API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::annotated::Annotated;
use super::types::{IssueStatus, IssueSummary};

// ============================================================================
// Common nested field types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiProject {
  #[serde(deserialize_with = "deserialize_u64_lenient")]
  pub id: u64,
  #[serde(default)]
  pub slug: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiAssignee {
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub email: Option<String>,
}

// ============================================================================
// Issue list endpoint response
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiIssue {
  pub id: String,
  #[serde(default)]
  pub short_id: String,
  #[serde(default)]
  pub title: String,
  pub culprit: Option<String>,
  #[serde(default)]
  pub status: String,
  #[serde(default)]
  pub level: String,
  #[serde(default, deserialize_with = "deserialize_u64_lenient")]
  pub count: u64,
  #[serde(default, deserialize_with = "deserialize_u64_lenient")]
  pub user_count: u64,
  pub first_seen: Option<DateTime<Utc>>,
  pub last_seen: Option<DateTime<Utc>>,
  pub project: ApiProject,
  pub assigned_to: Option<ApiAssignee>,
  /// Processing metadata for individual fields
  #[serde(rename = "_meta")]
  pub meta: Option<Value>,
}

// ============================================================================
// Bulk mutation request body
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiBulkUpdate {
  pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  pub detail: Option<Value>,
}

// ============================================================================
// Conversions to domain types
// ============================================================================

impl ApiIssue {
  pub fn into_summary(self) -> IssueSummary {
    let meta = self.meta.as_ref();
    IssueSummary {
      title: Annotated::from_parts(self.title, meta, "title"),
      id: self.id,
      short_id: self.short_id,
      culprit: self.culprit.filter(|c| !c.is_empty()),
      status: IssueStatus::parse(&self.status),
      level: self.level,
      count: self.count,
      user_count: self.user_count,
      first_seen: self.first_seen,
      last_seen: self.last_seen,
      project_id: self.project.id,
      project_slug: self.project.slug,
      assignee: self.assigned_to.and_then(|a| a.name.or(a.email)),
    }
  }
}

impl ApiErrorBody {
  /// Human readable message; `detail` is a string or `{"message": ...}`.
  pub fn message(&self) -> Option<String> {
    match self.detail.as_ref()? {
      Value::String(s) => Some(s.clone()),
      other => other
        .get("message")
        .and_then(Value::as_str)
        .map(String::from),
    }
  }
}

// ============================================================================
// Helpers
// ============================================================================

/// Counts and ids arrive as strings on some endpoints and numbers on others.
fn deserialize_u64_lenient<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
  D: Deserializer<'de>,
{
  match Value::deserialize(deserializer)? {
    Value::Number(n) => n
      .as_u64()
      .ok_or_else(|| serde::de::Error::custom(format!("expected unsigned integer, got {}", n))),
    Value::String(s) => s.parse().map_err(serde::de::Error::custom),
    Value::Null => Ok(0),
    other => Err(serde::de::Error::custom(format!(
      "expected number or string, got {}",
      other
    ))),
  }
}

/// Cursors advertised by a `Link` response header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageLinks {
  pub next: Option<String>,
  pub previous: Option<String>,
}

/// Parse a `Link` header of the form
/// `<url>; rel="previous"; results="false"; cursor="0:0:1", <url>; rel="next"; results="true"; cursor="0:100:0"`.
///
/// A cursor is only reported when the link says it has results.
pub fn parse_link_header(header: &str) -> PageLinks {
  let mut links = PageLinks::default();

  for chunk in header.split('<').skip(1) {
    let params = match chunk.split_once('>') {
      Some((_, params)) => params,
      None => continue,
    };

    let mut rel = None;
    let mut results = false;
    let mut cursor = None;
    for param in params.split(';') {
      let param = param.trim().trim_end_matches(',').trim();
      let (name, value) = match param.split_once('=') {
        Some(pair) => pair,
        None => continue,
      };
      let value = value.trim().trim_matches('"');
      match name.trim() {
        "rel" => rel = Some(value.to_string()),
        "results" => results = value == "true",
        "cursor" => cursor = Some(value.to_string()),
        _ => {}
      }
    }

    if !results {
      continue;
    }
    match rel.as_deref() {
      Some("next") => links.next = cursor,
      Some("previous") => links.previous = cursor,
      _ => {}
    }
  }

  links
}

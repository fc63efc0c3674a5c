use chrono::{DateTime, Utc};
use serde::Serialize;

use super::annotated::Annotated;
use crate::cache::ListRow;

/// Summary of an issue for list views
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueSummary {
  pub id: String,
  pub short_id: String,
  pub title: Annotated<String>,
  pub culprit: Option<String>,
  pub status: IssueStatus,
  pub level: String,
  /// Total events
  pub count: u64,
  pub user_count: u64,
  pub first_seen: Option<DateTime<Utc>>,
  pub last_seen: Option<DateTime<Utc>>,
  pub project_id: u64,
  pub project_slug: String,
  pub assignee: Option<String>,
}

impl ListRow for IssueSummary {
  fn row_id(&self) -> &str {
    &self.id
  }
}

/// Issue status, as accepted by the bulk mutation endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
  Unresolved,
  Resolved,
  Ignored,
}

impl IssueStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      IssueStatus::Unresolved => "unresolved",
      IssueStatus::Resolved => "resolved",
      IssueStatus::Ignored => "ignored",
    }
  }

  /// Unknown statuses (e.g. `reprocessing`) read as unresolved.
  pub fn parse(s: &str) -> Self {
    match s {
      "resolved" => IssueStatus::Resolved,
      "ignored" | "muted" => IssueStatus::Ignored,
      _ => IssueStatus::Unresolved,
    }
  }
}

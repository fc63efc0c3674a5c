use color_eyre::{eyre::eyre, Result};
use reqwest::header::LINK;
use reqwest::Response;
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::cache::Page;
use crate::config::{Config, SentryConfig};
use crate::error::FetchError;
use crate::query_state::QueryKey;
use crate::sentry::api_types::{parse_link_header, ApiBulkUpdate, ApiErrorBody, ApiIssue};
use crate::sentry::types::{IssueStatus, IssueSummary};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sentry REST API client
#[derive(Clone)]
pub struct SentryClient {
  http: reqwest::Client,
  issues_url: Url,
  token: String,
  limit: u32,
}

impl SentryClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_auth_token()?;
    Self::with_token(&config.sentry, token, config.defaults.limit())
  }

  pub fn with_token(sentry: &SentryConfig, token: String, limit: u32) -> Result<Self> {
    let issues_url = issues_url(&sentry.url, &sentry.organization)?;

    let http = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .user_agent(concat!("issuelist/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      issues_url,
      token,
      limit,
    })
  }

  pub fn issues_url(&self) -> &Url {
    &self.issues_url
  }

  /// Fetch one page of issues for `key`
  pub async fn fetch_issues(&self, key: &QueryKey) -> Result<Page<IssueSummary>, FetchError> {
    let mut query = key.state().to_query_pairs();
    query.push(("limit", self.limit.to_string()));

    let response = self
      .http
      .get(self.issues_url.clone())
      .bearer_auth(&self.token)
      .query(&query)
      .send()
      .await?;
    let response = check_status(response).await?;

    let links = response
      .headers()
      .get(LINK)
      .and_then(|v| v.to_str().ok())
      .map(parse_link_header)
      .unwrap_or_default();

    let issues: Vec<ApiIssue> = response.json().await?;

    Ok(Page {
      rows: issues.into_iter().map(ApiIssue::into_summary).collect(),
      next_cursor: links.next,
      previous_cursor: links.previous,
    })
  }

  /// Set the status of several issues at once
  pub async fn bulk_update(
    &self,
    project: Option<u64>,
    ids: &[String],
    status: IssueStatus,
  ) -> Result<(), FetchError> {
    let mut query: Vec<(&str, String)> = ids.iter().map(|id| ("id", id.clone())).collect();
    if let Some(project) = project {
      query.push(("project", project.to_string()));
    }

    let response = self
      .http
      .put(self.issues_url.clone())
      .bearer_auth(&self.token)
      .query(&query)
      .json(&ApiBulkUpdate {
        status: status.as_str(),
      })
      .send()
      .await?;
    check_status(response).await?;

    info!(count = ids.len(), status = status.as_str(), "Updated issue status");
    Ok(())
  }
}

/// `{base}/api/0/organizations/{org}/issues/`
fn issues_url(base: &str, organization: &str) -> Result<Url> {
  let mut base = Url::parse(base).map_err(|e| eyre!("Invalid Sentry URL {}: {}", base, e))?;
  if !base.path().ends_with('/') {
    let path = format!("{}/", base.path());
    base.set_path(&path);
  }
  base
    .join(&format!("api/0/organizations/{}/issues/", organization))
    .map_err(|e| eyre!("Invalid organization {}: {}", organization, e))
}

/// Turn a non-success response into [`FetchError::Status`], using the
/// API's `detail` message when there is one.
async fn check_status(response: Response) -> Result<Response, FetchError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let text = response.text().await.unwrap_or_default();
  let message = serde_json::from_str::<ApiErrorBody>(&text)
    .ok()
    .and_then(|body| body.message())
    .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

  Err(FetchError::Status {
    status: status.as_u16(),
    message,
  })
}

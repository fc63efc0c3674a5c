use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use issuelist::cache::{CacheEntry, CacheEvent};
use issuelist::config::Config;
use issuelist::format::{format_abbreviated, format_age, truncate};
use issuelist::list_query::{ListQuery, LoadState};
use issuelist::query_state::{Cursor, QueryDefaults, QueryKey, QueryStateStore};
use issuelist::sentry::{CachedSentryClient, IssueStatus, IssueSummary};

const TITLE_WIDTH: usize = 60;
const SHORT_ID_WIDTH: usize = 18;

/// Issue list front end: a query-state store driving one list view.
pub struct App {
  client: CachedSentryClient,
  store: QueryStateStore,
  list: ListQuery<IssueSummary>,
  changes: mpsc::UnboundedReceiver<QueryKey>,
}

/// JSON shape of one printed page
#[derive(Serialize)]
struct PageOutput<'a> {
  key: &'a str,
  next_cursor: Option<&'a str>,
  previous_cursor: Option<&'a str>,
  issues: &'a [IssueSummary],
}

impl App {
  pub fn new(config: &Config) -> Result<Self> {
    let client = CachedSentryClient::new(config)?;
    let mut store = QueryStateStore::new(config.defaults.query_defaults()?);

    // Every decoded change becomes a key for the list view to show
    let (tx, changes) = mpsc::unbounded_channel();
    store.subscribe(move |state| {
      let _ = tx.send(state.to_key());
    });

    let list = client.list_query();
    spawn_event_logger(&client);

    Ok(Self {
      client,
      store,
      list,
      changes,
    })
  }

  /// Print `pages` pages of the list described by `url`, following next cursors.
  pub async fn list_issues(&mut self, url: Option<&str>, pages: usize, json: bool) -> Result<()> {
    if let Some(url) = url {
      self.store.update_from_url(url);
    }
    self.follow_store();
    // Loading the key already in flight is a no-op
    self.list.load(self.store.key().clone());

    let pages = pages.max(1);
    for page in 1..=pages {
      let entry = self.wait_for_page().await?;
      print_page(&entry, json)?;

      if page == pages {
        break;
      }
      let next = match entry.next_cursor.as_deref().and_then(Cursor::parse) {
        Some(cursor) => cursor,
        None => {
          debug!(key = %entry.key, "No further pages");
          break;
        }
      };
      self.store.set_cursor(Some(next));
      self.follow_store();
    }

    Ok(())
  }

  /// Load the current page, change the status of `ids`, then show the
  /// page again with fresh data.
  pub async fn set_status(
    &mut self,
    url: Option<&str>,
    project: Option<u64>,
    ids: &[String],
    status: IssueStatus,
    json: bool,
  ) -> Result<()> {
    if ids.is_empty() {
      return Err(eyre!("No issue ids given"));
    }

    if let Some(url) = url {
      self.store.update_from_url(url);
    }
    self.follow_store();
    self.list.load(self.store.key().clone());
    self.wait_for_page().await?;

    let invalidated = self.client.update_status(project, ids, status).await?;
    info!(
      count = ids.len(),
      status = status.as_str(),
      invalidated,
      "Status changed"
    );

    // Invalidated pages are stale, so loading the same key refetches
    self.list.load(self.store.key().clone());
    let entry = self.wait_for_page().await?;
    print_page(&entry, json)
  }

  /// Apply any pending store changes to the list view.
  fn follow_store(&mut self) {
    while let Ok(key) = self.changes.try_recv() {
      self.list.load(key);
    }
  }

  async fn wait_for_page(&mut self) -> Result<CacheEntry<IssueSummary>> {
    self.list.settled().await;
    match self.list.state() {
      LoadState::Success(entry) => Ok(entry.clone()),
      LoadState::Error(e) => Err(eyre!("Failed to load issues: {}", e)),
      LoadState::Loading { .. } | LoadState::Idle => Err(eyre!("Issue list did not load")),
    }
  }
}

/// Print the canonical key for `url` without touching the network.
pub fn print_key(url: &str, defaults: QueryDefaults) {
  let mut store = QueryStateStore::new(defaults);
  store.update_from_url(url);
  let key = store.key();

  println!("key:    {}", key);
  println!("digest: {}", key.digest());
  println!("query:  {}", store.current().to_query_string());

  let (start, end) = store.current().range.bounds(chrono::Utc::now());
  println!("window: {} .. {}", start.to_rfc3339(), end.to_rfc3339());
}

fn spawn_event_logger(client: &CachedSentryClient) {
  let mut events = client.coordinator().subscribe_events();
  tokio::spawn(async move {
    while let Ok(event) = events.recv().await {
      match event {
        CacheEvent::Fetched { key, rows } => debug!(key = %key.digest(), rows, "Page cached"),
        CacheEvent::Failed { key, error } => debug!(key = %key.digest(), %error, "Page failed"),
        CacheEvent::Invalidated { count } => debug!(count, "Pages invalidated"),
        CacheEvent::Evicted { key } => debug!(key = %key.digest(), "Page evicted"),
        CacheEvent::Cleared => debug!("Cache cleared"),
      }
    }
  });
}

fn print_page(entry: &CacheEntry<IssueSummary>, json: bool) -> Result<()> {
  if json {
    let output = PageOutput {
      key: entry.key.as_str(),
      next_cursor: entry.next_cursor.as_deref(),
      previous_cursor: entry.previous_cursor.as_deref(),
      issues: &entry.rows,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    return Ok(());
  }

  if entry.rows.is_empty() {
    println!("No issues match {}", entry.key.state().query);
    return Ok(());
  }

  let now = chrono::Utc::now();
  println!(
    "{:<width$} {:<10} {:>6} {:>6} {:>5}  TITLE",
    "ID",
    "STATUS",
    "EVENTS",
    "USERS",
    "SEEN",
    width = SHORT_ID_WIDTH
  );
  for issue in entry.rows.iter() {
    let seen = issue
      .last_seen
      .map(|at| format_age(at, now))
      .unwrap_or_else(|| "-".to_string());
    let mut title = truncate(issue.title.value(), TITLE_WIDTH);
    if issue.title.is_annotated() {
      title.push_str(" [!]");
    }
    println!(
      "{:<width$} {:<10} {:>6} {:>6} {:>5}  {}",
      truncate(&issue.short_id, SHORT_ID_WIDTH),
      issue.status.as_str(),
      format_abbreviated(issue.count),
      format_abbreviated(issue.user_count),
      seen,
      title,
      width = SHORT_ID_WIDTH
    );
  }
  if let Some(next) = &entry.next_cursor {
    println!("-- more: cursor={}", next);
  }

  Ok(())
}

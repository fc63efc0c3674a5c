//! Decoded list-query state and its URL representation.
//!
//! The URL is an external, partially-trusted surface: every field that fails
//! to parse falls back to its default instead of raising.

mod key;
mod store;

pub use key::QueryKey;
pub use store::{ListenerId, QueryStateStore};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Raw key/value mapping taken from a URL query string. Repeated keys keep
/// every value in order of appearance.
pub type RawQuery = HashMap<String, Vec<String>>;

/// Sort orders offered by the issue list endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortField {
  /// Last seen (most recent)
  #[default]
  Date,
  /// First seen
  New,
  /// Event count
  Freq,
  /// Affected users
  User,
  Trends,
  Inbox,
}

impl SortField {
  pub fn as_str(&self) -> &'static str {
    match self {
      SortField::Date => "date",
      SortField::New => "new",
      SortField::Freq => "freq",
      SortField::User => "user",
      SortField::Trends => "trends",
      SortField::Inbox => "inbox",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.trim().to_lowercase().as_str() {
      "date" => Some(SortField::Date),
      "new" => Some(SortField::New),
      "freq" => Some(SortField::Freq),
      "user" => Some(SortField::User),
      "trends" => Some(SortField::Trends),
      "inbox" => Some(SortField::Inbox),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortDirection {
  Asc,
  #[default]
  Desc,
}

impl SortDirection {
  pub fn as_str(&self) -> &'static str {
    match self {
      SortDirection::Asc => "asc",
      SortDirection::Desc => "desc",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.trim().to_lowercase().as_str() {
      "asc" => Some(SortDirection::Asc),
      "desc" => Some(SortDirection::Desc),
      _ => None,
    }
  }
}

/// Unit of a relative period such as `14d`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodUnit {
  Seconds,
  Minutes,
  Hours,
  Days,
  Weeks,
}

impl PeriodUnit {
  fn suffix(&self) -> char {
    match self {
      PeriodUnit::Seconds => 's',
      PeriodUnit::Minutes => 'm',
      PeriodUnit::Hours => 'h',
      PeriodUnit::Days => 'd',
      PeriodUnit::Weeks => 'w',
    }
  }
}

/// Relative time window ending now, e.g. `24h` or `14d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
  pub amount: u32,
  pub unit: PeriodUnit,
}

impl Period {
  pub const fn days(amount: u32) -> Self {
    Self {
      amount,
      unit: PeriodUnit::Days,
    }
  }

  /// Parse `<amount><unit>`; the amount must be positive.
  pub fn parse(s: &str) -> Option<Self> {
    let s = s.trim().to_lowercase();
    let unit = match s.chars().last()? {
      's' => PeriodUnit::Seconds,
      'm' => PeriodUnit::Minutes,
      'h' => PeriodUnit::Hours,
      'd' => PeriodUnit::Days,
      'w' => PeriodUnit::Weeks,
      _ => return None,
    };
    let amount: u32 = s[..s.len() - 1].parse().ok()?;
    if amount == 0 {
      return None;
    }
    Some(Self { amount, unit })
  }

  pub fn to_duration(&self) -> Duration {
    let amount = i64::from(self.amount);
    match self.unit {
      PeriodUnit::Seconds => Duration::seconds(amount),
      PeriodUnit::Minutes => Duration::minutes(amount),
      PeriodUnit::Hours => Duration::hours(amount),
      PeriodUnit::Days => Duration::days(amount),
      PeriodUnit::Weeks => Duration::weeks(amount),
    }
  }
}

impl fmt::Display for Period {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{}", self.amount, self.unit.suffix())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeRange {
  Relative(Period),
  Absolute {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  },
}

impl Default for TimeRange {
  fn default() -> Self {
    TimeRange::Relative(Period::days(14))
  }
}

impl TimeRange {
  /// Concrete `(start, end)` of the range as seen at `now`.
  pub fn bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    match self {
      TimeRange::Relative(period) => {
        let start = now
          .checked_sub_signed(period.to_duration())
          .unwrap_or(DateTime::<Utc>::MIN_UTC);
        (start, now)
      }
      TimeRange::Absolute { start, end } => (*start, *end),
    }
  }
}

/// Pagination cursor in `value:offset:is_prev` form.
///
/// The value is a sort key, an integer for date sorts and a decimal for
/// score sorts. It is kept as received so server cursors round-trip
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor {
  pub value: String,
  pub offset: u32,
  pub is_prev: bool,
}

impl Cursor {
  /// Parse a cursor. A bare number is accepted as `value:0:0`.
  pub fn parse(s: &str) -> Option<Self> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    match parts.as_slice() {
      [value] => Some(Self {
        value: parse_cursor_value(value)?,
        offset: 0,
        is_prev: false,
      }),
      [value, offset, is_prev] => Some(Self {
        value: parse_cursor_value(value)?,
        offset: offset.parse().ok()?,
        is_prev: match *is_prev {
          "0" => false,
          "1" => true,
          _ => return None,
        },
      }),
      _ => None,
    }
  }
}

/// Accepts `123`, `-4`, `0.3489`; rejects empty parts, exponents and text.
fn parse_cursor_value(value: &str) -> Option<String> {
  let digits = value.strip_prefix('-').unwrap_or(value);
  let (whole, fraction) = match digits.split_once('.') {
    Some((whole, fraction)) => (whole, Some(fraction)),
    None => (digits, None),
  };
  let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
  if !all_digits(whole) || !fraction.map_or(true, all_digits) {
    return None;
  }
  Some(value.to_string())
}

impl fmt::Display for Cursor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.value, self.offset, u8::from(self.is_prev))
  }
}

/// Values used for fields missing from (or malformed in) the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDefaults {
  pub query: String,
  pub sort: SortField,
  pub direction: SortDirection,
  pub period: Period,
}

impl Default for QueryDefaults {
  fn default() -> Self {
    Self {
      query: "is:unresolved".to_string(),
      sort: SortField::Date,
      direction: SortDirection::Desc,
      period: Period::days(14),
    }
  }
}

/// Decoded list-query parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryState {
  pub query: String,
  pub sort: SortField,
  pub direction: SortDirection,
  pub environments: Vec<String>,
  pub projects: Vec<u64>,
  pub range: TimeRange,
  pub cursor: Option<Cursor>,
}

impl Default for QueryState {
  fn default() -> Self {
    QueryState::from_defaults(&QueryDefaults::default())
  }
}

impl QueryState {
  pub fn from_defaults(defaults: &QueryDefaults) -> Self {
    Self {
      query: defaults.query.clone(),
      sort: defaults.sort,
      direction: defaults.direction,
      environments: Vec::new(),
      projects: Vec::new(),
      range: TimeRange::Relative(defaults.period),
      cursor: None,
    }
  }

  /// Canonical cache key for this state
  pub fn to_key(&self) -> QueryKey {
    QueryKey::from_state(self)
  }

  /// Same state pointing at another page
  pub fn with_cursor(&self, cursor: Option<Cursor>) -> Self {
    Self {
      cursor,
      ..self.clone()
    }
  }

  /// Encode back into URL query pairs, in the order the list endpoint
  /// documents them.
  pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
    let mut pairs = vec![
      ("query", self.query.clone()),
      ("sort", self.sort.as_str().to_string()),
      ("direction", self.direction.as_str().to_string()),
    ];
    match &self.range {
      TimeRange::Relative(period) => pairs.push(("statsPeriod", period.to_string())),
      TimeRange::Absolute { start, end } => {
        pairs.push(("start", format_timestamp(start)));
        pairs.push(("end", format_timestamp(end)));
      }
    }
    for project in &self.projects {
      pairs.push(("project", project.to_string()));
    }
    for env in &self.environments {
      pairs.push(("environment", env.clone()));
    }
    if let Some(cursor) = &self.cursor {
      pairs.push(("cursor", cursor.to_string()));
    }
    pairs
  }

  /// Encode as a URL query string (without the leading `?`).
  pub fn to_query_string(&self) -> String {
    url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(self.to_query_pairs())
      .finish()
  }
}

/// Decode raw URL parameters using the built-in defaults.
pub fn decode(raw: &RawQuery) -> QueryState {
  decode_with(raw, &QueryDefaults::default())
}

/// Decode raw URL parameters, falling back to `defaults` field by field.
pub fn decode_with(raw: &RawQuery, defaults: &QueryDefaults) -> QueryState {
  let mut state = QueryState::from_defaults(defaults);

  if let Some(query) = first(raw, "query") {
    state.query = query.trim().to_string();
  }

  if let Some(sort) = first(raw, "sort") {
    match SortField::parse(sort) {
      Some(sort) => state.sort = sort,
      None => debug!(value = sort, "Ignoring unknown sort"),
    }
  }

  if let Some(direction) = first(raw, "direction") {
    match SortDirection::parse(direction) {
      Some(direction) => state.direction = direction,
      None => debug!(value = direction, "Ignoring unknown sort direction"),
    }
  }

  state.range = decode_range(raw, defaults);

  if let Some(values) = raw.get("project") {
    state.projects = values
      .iter()
      .filter_map(|v| match v.trim().parse::<u64>() {
        Ok(id) => Some(id),
        Err(_) => {
          debug!(value = v.as_str(), "Dropping non-numeric project id");
          None
        }
      })
      .collect();
  }

  if let Some(values) = raw.get("environment") {
    state.environments = values
      .iter()
      .map(|v| v.trim())
      .filter(|v| !v.is_empty())
      .map(String::from)
      .collect();
  }

  if let Some(cursor) = first(raw, "cursor") {
    match Cursor::parse(cursor) {
      Some(cursor) => state.cursor = Some(cursor),
      None => debug!(value = cursor, "Ignoring malformed cursor"),
    }
  }

  state
}

/// `statsPeriod` wins when valid; otherwise a valid, ordered `start`/`end`
/// pair; otherwise the default period.
fn decode_range(raw: &RawQuery, defaults: &QueryDefaults) -> TimeRange {
  if let Some(period) = first(raw, "statsPeriod") {
    match Period::parse(period) {
      Some(period) => return TimeRange::Relative(period),
      None => debug!(value = period, "Ignoring malformed statsPeriod"),
    }
  }

  let start = first(raw, "start");
  let end = first(raw, "end");
  if start.is_some() || end.is_some() {
    match (start.and_then(parse_timestamp), end.and_then(parse_timestamp)) {
      (Some(start), Some(end)) if start <= end => {
        return TimeRange::Absolute { start, end };
      }
      _ => debug!(?start, ?end, "Ignoring invalid absolute time range"),
    }
  }

  TimeRange::Relative(defaults.period)
}

fn first<'a>(raw: &'a RawQuery, name: &str) -> Option<&'a str> {
  raw.get(name).and_then(|v| v.first()).map(String::as_str)
}

/// Parse an ISO 8601 timestamp. Values without an offset are taken as UTC.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  let s = s.trim();
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc));
  }
  NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
    .ok()
    .map(|dt| dt.and_utc())
}

fn format_timestamp(dt: &DateTime<Utc>) -> String {
  dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Build a raw mapping from a query string, with or without the leading `?`.
pub fn raw_from_query_string(query: &str) -> RawQuery {
  let mut raw = RawQuery::new();
  let query = query.strip_prefix('?').unwrap_or(query);
  for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
    raw
      .entry(name.into_owned())
      .or_default()
      .push(value.into_owned());
  }
  raw
}

/// Build a raw mapping from a full URL; anything that does not parse as a
/// URL is treated as a bare query string.
pub fn raw_from_url(input: &str) -> RawQuery {
  match url::Url::parse(input) {
    Ok(url) => raw_from_query_string(url.query().unwrap_or("")),
    Err(_) => raw_from_query_string(input),
  }
}

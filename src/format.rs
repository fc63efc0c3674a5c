//! Text helpers for the issue table.

use chrono::{DateTime, Utc};

/// Truncate a string to at most `max_len` characters, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    return s.to_string();
  }
  let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
  format!("{}...", kept)
}

/// Abbreviate a count for narrow columns: `999`, `1.2k`, `34m`, `5b`.
///
/// One decimal is shown below ten units, none above.
pub fn format_abbreviated(n: u64) -> String {
  const UNITS: [(u64, &str); 3] = [(1_000_000_000, "b"), (1_000_000, "m"), (1_000, "k")];

  for (size, suffix) in UNITS {
    if n >= size {
      let tenths = u128::from(n) * 10 / u128::from(size);
      return if tenths < 100 && tenths % 10 != 0 {
        format!("{}.{}{}", tenths / 10, tenths % 10, suffix)
      } else {
        format!("{}{}", n / size, suffix)
      };
    }
  }
  n.to_string()
}

/// Coarse age such as `5m` or `3d`
pub fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
  let secs = (now - at).num_seconds().max(0);
  match secs {
    s if s < 60 => format!("{}s", s),
    s if s < 3_600 => format!("{}m", s / 60),
    s if s < 86_400 => format!("{}h", s / 3_600),
    s => format!("{}d", s / 86_400),
  }
}

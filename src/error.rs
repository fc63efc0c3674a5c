//! Error types shared between the fetch coordinator and its fetchers.

use thiserror::Error;

/// Failure of a list fetch.
///
/// Cloneable so one failed request can reject every waiter attached to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// The backend answered with a non-success status
  #[error("request failed with status {status}: {message}")]
  Status { status: u16, message: String },

  /// The request never produced a response (connect, timeout, TLS)
  #[error("transport error: {0}")]
  Transport(String),

  /// The response body could not be decoded
  #[error("failed to decode response: {0}")]
  Decode(String),

  /// The waiter was cancelled before the request settled
  #[error("request was cancelled")]
  Cancelled,
}

impl FetchError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, FetchError::Cancelled)
  }
}

impl From<reqwest::Error> for FetchError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_decode() {
      return FetchError::Decode(err.to_string());
    }
    match err.status() {
      Some(status) => FetchError::Status {
        status: status.as_u16(),
        message: err.to_string(),
      },
      None => FetchError::Transport(err.to_string()),
    }
  }
}

impl From<serde_json::Error> for FetchError {
  fn from(err: serde_json::Error) -> Self {
    FetchError::Decode(err.to_string())
  }
}

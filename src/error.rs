//! Error types shared by the sync engine and the GitHub layer.

use thiserror::Error;

/// Errors surfaced by sync cycles and the request gateway.
///
/// Variants carry owned strings rather than source errors so a single
/// cycle outcome can be cloned to every concurrent `refresh()` caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SyncError {
  /// HTTP error response from the API (anything other than 2xx/304).
  #[error("HTTP {status}: {message}")]
  Http { status: u16, message: String },

  /// Transport-level failure (connection, TLS, timeout). Retryable.
  #[error("Network error: {0}")]
  Network(String),

  /// A payload that could not be serialized or interpreted (request
  /// params, response deserialization, selector or key extraction).
  #[error("Malformed response: {0}")]
  Malformed(String),

  /// The collection was disposed while a cycle was in flight.
  #[error("Collection disposed")]
  Disposed,

  /// The first sync never completed: every attempt up to the configured
  /// limit failed before any data was fetched.
  #[error("First sync failed after {attempts} attempts: {message}")]
  NeverReady { attempts: u32, message: String },

  /// Configuration loading or validation failed.
  #[error("Configuration error: {0}")]
  Config(String),
}

impl SyncError {
  /// HTTP status carried by this error, if it came from an HTTP response.
  pub fn status(&self) -> Option<u16> {
    match self {
      SyncError::Http { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// True for failures where a later retry can reasonably succeed.
  pub fn is_transient(&self) -> bool {
    matches!(self, SyncError::Network(_) | SyncError::Http { .. })
  }
}

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

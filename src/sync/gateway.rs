//! Conditional-request gateway.
//!
//! Wraps an arbitrary request function with validator-based caching: the
//! gateway remembers the `etag` or `last-modified` value of the previous
//! successful response per cache key and asks the server to answer with
//! 304 when nothing changed. A 304 becomes the [`Fetched::Unchanged`]
//! sentinel rather than an error.
//!
//! The gateway only tracks validators. Caching of the actual response
//! data is the caller's responsibility.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// Which response header is used as the change validator for a request.
///
/// `Etag` suits list endpoints; `Timestamp` (last-modified) suits repeated
/// polling of a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidatorKind {
  Etag,
  Timestamp,
}

/// Conditional header to attach to an outgoing request.
///
/// This is handed to the request function as an explicit argument instead
/// of being spliced into its parameters, so request functions stay plain
/// data-in/data-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
  IfNoneMatch(String),
  IfModifiedSince(String),
}

impl Precondition {
  pub fn header_name(&self) -> &'static str {
    match self {
      Precondition::IfNoneMatch(_) => "if-none-match",
      Precondition::IfModifiedSince(_) => "if-modified-since",
    }
  }

  pub fn value(&self) -> &str {
    match self {
      Precondition::IfNoneMatch(v) | Precondition::IfModifiedSince(v) => v,
    }
  }
}

/// Validator-bearing response headers, extracted by the request function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
  pub etag: Option<String>,
  pub last_modified: Option<String>,
}

/// A successful response: payload plus the headers the gateway cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse<T> {
  pub data: T,
  pub headers: ResponseHeaders,
}

/// Outcome of a conditional request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<T> {
  /// The server returned a fresh body.
  Changed(T),
  /// The server confirmed (304) that nothing changed since the stored
  /// validator.
  Unchanged,
}

impl<T> Fetched<T> {
  pub fn is_unchanged(&self) -> bool {
    matches!(self, Fetched::Unchanged)
  }
}

/// Conditional-request cache over an arbitrary request function.
///
/// The validator store is owned by the gateway instance; two gateways
/// never share state, so isolated clients (and isolated tests) come for
/// free.
pub struct RequestGateway {
  validators: Mutex<HashMap<(String, ValidatorKind), String>>,
}

impl RequestGateway {
  pub fn new() -> Self {
    Self {
      validators: Mutex::new(HashMap::new()),
    }
  }

  /// Issue `request` with a conditional header when a validator is known
  /// for this cache key.
  ///
  /// `cache_id` identifies the request for validator storage; when omitted
  /// it defaults to a hash of the serialized `params`, so identical params
  /// share a validator. Returns [`Fetched::Unchanged`] on 304 without
  /// touching the store. On success the validator named by `kind` is
  /// stored if the response carries one; a success without the header
  /// leaves the store as-is, and the next call performs a full fetch
  /// again.
  ///
  /// Concurrent calls sharing a cache key are not coalesced here; each
  /// issues its own upstream request and the last response to land wins
  /// the store update. Callers needing single-flight semantics serialize
  /// above this layer.
  pub async fn conditional<P, T, F, Fut>(
    &self,
    cache_id: Option<&str>,
    kind: ValidatorKind,
    params: P,
    request: F,
  ) -> SyncResult<Fetched<RawResponse<T>>>
  where
    P: Serialize,
    F: FnOnce(P, Option<Precondition>) -> Fut,
    Fut: Future<Output = SyncResult<RawResponse<T>>>,
  {
    let cache_key = match cache_id {
      Some(id) => id.to_string(),
      None => stable_cache_key(&params)?,
    };

    let stored = self
      .validators
      .lock()
      .get(&(cache_key.clone(), kind))
      .cloned();
    let precondition = stored.map(|value| match kind {
      ValidatorKind::Etag => Precondition::IfNoneMatch(value),
      ValidatorKind::Timestamp => Precondition::IfModifiedSince(value),
    });

    match request(params, precondition).await {
      Ok(response) => {
        let validator = match kind {
          ValidatorKind::Etag => response.headers.etag.clone(),
          ValidatorKind::Timestamp => response.headers.last_modified.clone(),
        };
        if let Some(validator) = validator {
          self.validators.lock().insert((cache_key, kind), validator);
        }
        Ok(Fetched::Changed(response))
      }
      Err(SyncError::Http { status: 304, .. }) => {
        debug!(cache_key = %cache_key, "not modified");
        Ok(Fetched::Unchanged)
      }
      Err(err) => {
        warn!(cache_key = %cache_key, error = %err, "conditional request failed");
        Err(err)
      }
    }
  }
}

impl Default for RequestGateway {
  fn default() -> Self {
    Self::new()
  }
}

/// Stable cache key for a params struct: SHA-256 of its JSON form.
fn stable_cache_key<P: Serialize>(params: &P) -> SyncResult<String> {
  let json = serde_json::to_string(params)
    .map_err(|e| SyncError::Malformed(format!("request params not serializable: {e}")))?;
  let mut hasher = Sha256::new();
  hasher.update(json.as_bytes());
  Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[derive(Serialize, Clone)]
  struct Params {
    owner: String,
    repo: String,
  }

  fn params() -> Params {
    Params {
      owner: "octo".to_string(),
      repo: "demo".to_string(),
    }
  }

  /// Records the precondition of every call and replays scripted results.
  struct FakeEndpoint {
    seen: Mutex<Vec<Option<Precondition>>>,
    results: Mutex<Vec<SyncResult<RawResponse<u32>>>>,
  }

  impl FakeEndpoint {
    fn new(results: Vec<SyncResult<RawResponse<u32>>>) -> Arc<Self> {
      Arc::new(Self {
        seen: Mutex::new(Vec::new()),
        results: Mutex::new(results),
      })
    }

    async fn call(
      self: Arc<Self>,
      _params: Params,
      precondition: Option<Precondition>,
    ) -> SyncResult<RawResponse<u32>> {
      self.seen.lock().push(precondition);
      self.results.lock().remove(0)
    }
  }

  fn with_etag(data: u32, etag: &str) -> SyncResult<RawResponse<u32>> {
    Ok(RawResponse {
      data,
      headers: ResponseHeaders {
        etag: Some(etag.to_string()),
        last_modified: None,
      },
    })
  }

  fn not_modified() -> SyncResult<RawResponse<u32>> {
    Err(SyncError::Http {
      status: 304,
      message: "Not Modified".to_string(),
    })
  }

  #[tokio::test]
  async fn stored_etag_is_echoed_as_if_none_match() {
    let gateway = RequestGateway::new();
    let endpoint = FakeEndpoint::new(vec![with_etag(1, "abc"), not_modified()]);

    let first = gateway
      .conditional(Some("runs"), ValidatorKind::Etag, params(), {
        let ep = endpoint.clone();
        move |p, pre| ep.call(p, pre)
      })
      .await
      .unwrap();
    assert!(matches!(first, Fetched::Changed(ref r) if r.data == 1));

    let second = gateway
      .conditional(Some("runs"), ValidatorKind::Etag, params(), {
        let ep = endpoint.clone();
        move |p, pre| ep.call(p, pre)
      })
      .await
      .unwrap();
    assert!(second.is_unchanged());

    let seen = endpoint.seen.lock();
    assert_eq!(seen[0], None);
    assert_eq!(seen[1], Some(Precondition::IfNoneMatch("abc".to_string())));
  }

  #[tokio::test]
  async fn a_304_does_not_clear_the_stored_validator() {
    let gateway = RequestGateway::new();
    let endpoint = FakeEndpoint::new(vec![with_etag(1, "abc"), not_modified(), not_modified()]);

    for _ in 0..3 {
      let ep = endpoint.clone();
      gateway
        .conditional(Some("runs"), ValidatorKind::Etag, params(), move |p, pre| {
          ep.call(p, pre)
        })
        .await
        .unwrap();
    }

    let seen = endpoint.seen.lock();
    // The validator from the single 2xx response survives both 304s.
    assert_eq!(seen[2], Some(Precondition::IfNoneMatch("abc".to_string())));
  }

  #[tokio::test]
  async fn success_without_validator_header_leaves_store_untouched() {
    let gateway = RequestGateway::new();
    let no_header = Ok(RawResponse {
      data: 2,
      headers: ResponseHeaders::default(),
    });
    let endpoint = FakeEndpoint::new(vec![with_etag(1, "abc"), no_header, not_modified()]);

    for _ in 0..3 {
      let ep = endpoint.clone();
      gateway
        .conditional(Some("runs"), ValidatorKind::Etag, params(), move |p, pre| {
          ep.call(p, pre)
        })
        .await
        .unwrap();
    }

    let seen = endpoint.seen.lock();
    // The headerless success did not overwrite "abc".
    assert_eq!(seen[2], Some(Precondition::IfNoneMatch("abc".to_string())));
  }

  #[tokio::test]
  async fn timestamp_kind_uses_if_modified_since() {
    let gateway = RequestGateway::new();
    let dated = Ok(RawResponse {
      data: 1,
      headers: ResponseHeaders {
        etag: None,
        last_modified: Some("Wed, 01 Jan 2025 00:00:00 GMT".to_string()),
      },
    });
    let endpoint = FakeEndpoint::new(vec![dated, not_modified()]);

    for _ in 0..2 {
      let ep = endpoint.clone();
      gateway
        .conditional(
          Some("run-7"),
          ValidatorKind::Timestamp,
          params(),
          move |p, pre| ep.call(p, pre),
        )
        .await
        .unwrap();
    }

    let seen = endpoint.seen.lock();
    assert_eq!(
      seen[1],
      Some(Precondition::IfModifiedSince(
        "Wed, 01 Jan 2025 00:00:00 GMT".to_string()
      ))
    );
  }

  #[tokio::test]
  async fn default_cache_key_is_stable_for_identical_params() {
    let gateway = RequestGateway::new();
    let endpoint = FakeEndpoint::new(vec![with_etag(1, "abc"), not_modified()]);

    for _ in 0..2 {
      let ep = endpoint.clone();
      gateway
        .conditional(None, ValidatorKind::Etag, params(), move |p, pre| {
          ep.call(p, pre)
        })
        .await
        .unwrap();
    }

    let seen = endpoint.seen.lock();
    assert_eq!(seen[1], Some(Precondition::IfNoneMatch("abc".to_string())));
  }

  #[tokio::test]
  async fn validator_stores_are_per_instance() {
    let first = RequestGateway::new();
    let second = RequestGateway::new();
    let endpoint = FakeEndpoint::new(vec![with_etag(1, "abc"), with_etag(1, "abc")]);

    let ep = endpoint.clone();
    first
      .conditional(Some("runs"), ValidatorKind::Etag, params(), move |p, pre| {
        ep.call(p, pre)
      })
      .await
      .unwrap();

    let ep = endpoint.clone();
    second
      .conditional(Some("runs"), ValidatorKind::Etag, params(), move |p, pre| {
        ep.call(p, pre)
      })
      .await
      .unwrap();

    let seen = endpoint.seen.lock();
    // The second gateway saw no validator from the first one's store.
    assert_eq!(seen[1], None);
  }

  #[tokio::test]
  async fn http_errors_propagate_with_status() {
    let gateway = RequestGateway::new();
    let endpoint = FakeEndpoint::new(vec![Err(SyncError::Http {
      status: 500,
      message: "boom".to_string(),
    })]);

    let ep = endpoint.clone();
    let err = gateway
      .conditional(Some("runs"), ValidatorKind::Etag, params(), move |p, pre| {
        ep.call(p, pre)
      })
      .await
      .unwrap_err();

    assert_eq!(err.status(), Some(500));
  }
}

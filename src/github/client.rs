//! HTTP request functions for the Actions REST API.
//!
//! Each endpoint method has the shape the request gateway expects: it
//! takes typed params plus an optional precondition and resolves to the
//! raw JSON body with the validator-bearing headers. Interpretation of
//! the body is left to the selectors.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex;
use reqwest::header::{self, HeaderMap};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::sync::{Precondition, RawResponse, ResponseHeaders};

/// Warn once the remaining request quota falls below this.
const LOW_QUOTA_WARNING: u32 = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Rate-limit snapshot from the most recent `x-ratelimit-*` headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimit {
  pub limit: Option<u32>,
  pub remaining: Option<u32>,
  pub used: Option<u32>,
  pub reset: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListRunsParams {
  pub owner: String,
  pub repo: String,
  pub branch: Option<String>,
  pub per_page: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetRunParams {
  pub owner: String,
  pub repo: String,
  pub run_id: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListJobsParams {
  pub owner: String,
  pub repo: String,
  pub run_id: u64,
  pub per_page: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListWorkflowsParams {
  pub owner: String,
  pub repo: String,
  pub per_page: u32,
}

/// Actions API client wrapper.
#[derive(Clone)]
pub struct ActionsClient {
  http: reqwest::Client,
  base_url: Url,
  token: String,
  rate_limit: Arc<Mutex<RateLimit>>,
}

impl ActionsClient {
  pub fn new(base_url: &str, token: String) -> Result<Self> {
    let http = reqwest::Client::builder()
      .user_agent(concat!("gha-watch/", env!("CARGO_PKG_VERSION")))
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let base_url = Url::parse(&normalize_base_url(base_url))
      .map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;

    Ok(Self {
      http,
      base_url,
      token,
      rate_limit: Arc::new(Mutex::new(RateLimit::default())),
    })
  }

  /// Most recent rate-limit telemetry.
  pub fn rate_limit(&self) -> RateLimit {
    self.rate_limit.lock().clone()
  }

  /// List workflow runs for a repository, optionally filtered by branch.
  pub async fn list_workflow_runs(
    &self,
    params: &ListRunsParams,
    precondition: Option<Precondition>,
  ) -> SyncResult<RawResponse<Value>> {
    let path = format!("repos/{}/{}/actions/runs", params.owner, params.repo);
    let mut query = vec![("per_page", params.per_page.to_string())];
    if let Some(branch) = &params.branch {
      query.push(("branch", branch.clone()));
    }
    self.get_json(&path, &query, precondition).await
  }

  /// Get a single workflow run by id.
  pub async fn get_workflow_run(
    &self,
    params: &GetRunParams,
    precondition: Option<Precondition>,
  ) -> SyncResult<RawResponse<Value>> {
    let path = format!(
      "repos/{}/{}/actions/runs/{}",
      params.owner, params.repo, params.run_id
    );
    self.get_json(&path, &[], precondition).await
  }

  /// List jobs for a workflow run.
  pub async fn list_run_jobs(
    &self,
    params: &ListJobsParams,
    precondition: Option<Precondition>,
  ) -> SyncResult<RawResponse<Value>> {
    let path = format!(
      "repos/{}/{}/actions/runs/{}/jobs",
      params.owner, params.repo, params.run_id
    );
    let query = vec![("per_page", params.per_page.to_string())];
    self.get_json(&path, &query, precondition).await
  }

  /// List workflow definitions for a repository.
  pub async fn list_workflows(
    &self,
    params: &ListWorkflowsParams,
    precondition: Option<Precondition>,
  ) -> SyncResult<RawResponse<Value>> {
    let path = format!("repos/{}/{}/actions/workflows", params.owner, params.repo);
    let query = vec![("per_page", params.per_page.to_string())];
    self.get_json(&path, &query, precondition).await
  }

  /// Conditional GET returning the raw JSON body plus validator headers.
  async fn get_json(
    &self,
    path: &str,
    query: &[(&str, String)],
    precondition: Option<Precondition>,
  ) -> SyncResult<RawResponse<Value>> {
    let mut url = self
      .base_url
      .join(path)
      .map_err(|e| SyncError::Config(format!("invalid request path {path}: {e}")))?;
    for (name, value) in query {
      url.query_pairs_mut().append_pair(name, value);
    }

    let mut request = self
      .http
      .get(url)
      .header(header::ACCEPT, "application/vnd.github+json")
      .header("x-github-api-version", "2022-11-28")
      .bearer_auth(&self.token);
    if let Some(precondition) = &precondition {
      request = request.header(precondition.header_name(), precondition.value());
    }

    let response = request
      .send()
      .await
      .map_err(|e| SyncError::Network(format!("GET {path}: {e}")))?;

    self.record_rate_limit(response.headers());

    let status = response.status();
    let headers = ResponseHeaders {
      etag: header_string(response.headers(), header::ETAG.as_str()),
      last_modified: header_string(response.headers(), header::LAST_MODIFIED.as_str()),
    };

    if !status.is_success() {
      let reason = status.canonical_reason().unwrap_or("unknown");
      return Err(SyncError::Http {
        status: status.as_u16(),
        message: format!("GET {path}: {reason}"),
      });
    }

    debug!(path, status = status.as_u16(), "API response");

    let data = response
      .json::<Value>()
      .await
      .map_err(|e| SyncError::Malformed(format!("GET {path}: {e}")))?;

    Ok(RawResponse { data, headers })
  }

  fn record_rate_limit(&self, headers: &HeaderMap) {
    let mut snapshot = self.rate_limit.lock();
    update_rate_limit(&mut snapshot, headers);
    if let Some(remaining) = snapshot.remaining {
      if remaining < LOW_QUOTA_WARNING {
        warn!(remaining, "API rate limit quota is low");
      }
    }
  }
}

/// `Url::join` treats a base without a trailing slash as a file and
/// replaces its last segment, which breaks GHES-style base paths.
fn normalize_base_url(base: &str) -> String {
  if base.ends_with('/') {
    base.to_string()
  } else {
    format!("{base}/")
  }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
  headers
    .get(name)
    .and_then(|value| value.to_str().ok())
    .map(String::from)
}

/// Fold `x-ratelimit-*` headers into the snapshot, keeping previous
/// values for headers a response does not carry.
fn update_rate_limit(snapshot: &mut RateLimit, headers: &HeaderMap) {
  let parse = |name: &str| {
    headers
      .get(name)
      .and_then(|value| value.to_str().ok())
      .and_then(|value| value.parse::<u32>().ok())
  };

  if let Some(limit) = parse("x-ratelimit-limit") {
    snapshot.limit = Some(limit);
  }
  if let Some(remaining) = parse("x-ratelimit-remaining") {
    snapshot.remaining = Some(remaining);
  }
  if let Some(used) = parse("x-ratelimit-used") {
    snapshot.used = Some(used);
  }
  if let Some(reset) = headers
    .get("x-ratelimit-reset")
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.parse::<i64>().ok())
  {
    snapshot.reset = DateTime::from_timestamp(reset, 0);
  }
}

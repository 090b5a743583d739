//! Scheduled mirrors of the Actions collections for one repository.
//!
//! This wires the generic sync engine to the concrete API: each mirror
//! gets its fetch params, cache id, selector, comparator and key
//! extractor here. Consumers only see the scheduled handles and their
//! change feeds.

use std::sync::Arc;

use color_eyre::Result;

use super::api_types::{
  select_run_jobs, select_single_run, select_workflow_runs, select_workflows,
};
use super::client::{
  ActionsClient, GetRunParams, ListJobsParams, ListRunsParams, ListWorkflowsParams,
};
use super::types::{Workflow, WorkflowJob, WorkflowRun};
use crate::config::Config;
use crate::error::SyncError;
use crate::sync::{
  ChangeFeed, CollectionSync, Fetched, RequestGateway, ScheduledSync, SyncOptions, SyncScheduler,
  ValidatorKind,
};

/// Attempt budget when polling a single run to completion.
pub const WATCH_RUN_ATTEMPTS: u32 = 20;

/// A branch-filtered run listing is expected to fit one page; paging of
/// the request functions themselves is the HTTP client's concern.
const PER_PAGE: u32 = 100;

/// Local mirror of GitHub Actions state for one repository.
///
/// Owns the request gateway (and with it the validator store) and the
/// scheduler driving all of its collections.
pub struct ActionsMirror {
  client: ActionsClient,
  gateway: Arc<RequestGateway>,
  scheduler: SyncScheduler,
  owner: String,
  repo: String,
  first_sync_failures: u32,
}

impl ActionsMirror {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::api_token()?;
    let client = ActionsClient::new(&config.github.url, token)?;

    Ok(Self {
      client,
      gateway: Arc::new(RequestGateway::new()),
      scheduler: SyncScheduler::new(config.poll.to_poll_config()),
      owner: config.github.owner.clone(),
      repo: config.github.repo.clone(),
      first_sync_failures: config.poll.first_sync_failures,
    })
  }

  pub fn client(&self) -> &ActionsClient {
    &self.client
  }

  /// Mirror of the repository's workflow runs, newest first, optionally
  /// filtered by branch.
  pub fn workflow_runs(&self, branch: Option<&str>) -> ScheduledSync<u64, WorkflowRun> {
    let params = ListRunsParams {
      owner: self.owner.clone(),
      repo: self.repo.clone(),
      branch: branch.map(String::from),
      per_page: PER_PAGE,
    };
    let cache_id = format!(
      "listWorkflowRuns-{}/{}-{}",
      self.owner,
      self.repo,
      branch.unwrap_or("all")
    );
    let query_key = vec![
      "runs".to_string(),
      format!("{}/{}", self.owner, self.repo),
      branch.unwrap_or("all").to_string(),
    ];

    let client = self.client.clone();
    let gateway = Arc::clone(&self.gateway);
    let collection = CollectionSync::with_options(
      query_key,
      move || {
        let client = client.clone();
        let gateway = Arc::clone(&gateway);
        let params = params.clone();
        let cache_id = cache_id.clone();
        async move {
          let fetched = gateway
            .conditional(Some(&cache_id), ValidatorKind::Etag, params, |p, pre| {
              let client = client.clone();
              async move { client.list_workflow_runs(&p, pre).await }
            })
            .await?;
          match fetched {
            Fetched::Unchanged => Ok(Fetched::Unchanged),
            Fetched::Changed(response) => {
              let runs = select_workflow_runs(response.data)
                .map_err(|e| SyncError::Malformed(format!("workflow runs payload: {e}")))?;
              Ok(Fetched::Changed(runs))
            }
          }
        }
      },
      |run: &WorkflowRun| run.id,
      SyncOptions {
        comparator: Some(Arc::new(|a: &WorkflowRun, b: &WorkflowRun| {
          b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id))
        })),
        first_sync_failures: self.first_sync_failures,
      },
    );

    self.scheduler.schedule(collection, ChangeFeed::new(), None)
  }

  /// Mirror of the jobs of one workflow run.
  pub fn run_jobs(&self, run_id: u64) -> ScheduledSync<u64, WorkflowJob> {
    let params = ListJobsParams {
      owner: self.owner.clone(),
      repo: self.repo.clone(),
      run_id,
      per_page: PER_PAGE,
    };
    let cache_id = format!("listJobsForWorkflowRun-{run_id}");
    let query_key = vec![
      "jobs".to_string(),
      format!("{}/{}", self.owner, self.repo),
      run_id.to_string(),
    ];

    let client = self.client.clone();
    let gateway = Arc::clone(&self.gateway);
    let collection = CollectionSync::with_options(
      query_key,
      move || {
        let client = client.clone();
        let gateway = Arc::clone(&gateway);
        let params = params.clone();
        let cache_id = cache_id.clone();
        async move {
          let fetched = gateway
            .conditional(Some(&cache_id), ValidatorKind::Etag, params, |p, pre| {
              let client = client.clone();
              async move { client.list_run_jobs(&p, pre).await }
            })
            .await?;
          match fetched {
            Fetched::Unchanged => Ok(Fetched::Unchanged),
            Fetched::Changed(response) => {
              let jobs = select_run_jobs(response.data)
                .map_err(|e| SyncError::Malformed(format!("run jobs payload: {e}")))?;
              Ok(Fetched::Changed(jobs))
            }
          }
        }
      },
      |job: &WorkflowJob| job.id,
      SyncOptions {
        comparator: Some(Arc::new(|a: &WorkflowJob, b: &WorkflowJob| a.id.cmp(&b.id))),
        first_sync_failures: self.first_sync_failures,
      },
    );

    self.scheduler.schedule(collection, ChangeFeed::new(), None)
  }

  /// Mirror of the repository's workflow definitions, by name.
  pub fn workflows(&self) -> ScheduledSync<u64, Workflow> {
    let params = ListWorkflowsParams {
      owner: self.owner.clone(),
      repo: self.repo.clone(),
      per_page: PER_PAGE,
    };
    let cache_id = format!("listRepoWorkflows-{}/{}", self.owner, self.repo);
    let query_key = vec![
      "workflows".to_string(),
      format!("{}/{}", self.owner, self.repo),
    ];

    let client = self.client.clone();
    let gateway = Arc::clone(&self.gateway);
    let collection = CollectionSync::with_options(
      query_key,
      move || {
        let client = client.clone();
        let gateway = Arc::clone(&gateway);
        let params = params.clone();
        let cache_id = cache_id.clone();
        async move {
          let fetched = gateway
            .conditional(Some(&cache_id), ValidatorKind::Etag, params, |p, pre| {
              let client = client.clone();
              async move { client.list_workflows(&p, pre).await }
            })
            .await?;
          match fetched {
            Fetched::Unchanged => Ok(Fetched::Unchanged),
            Fetched::Changed(response) => {
              let workflows = select_workflows(response.data)
                .map_err(|e| SyncError::Malformed(format!("workflows payload: {e}")))?;
              Ok(Fetched::Changed(workflows))
            }
          }
        }
      },
      |workflow: &Workflow| workflow.id,
      SyncOptions {
        comparator: Some(Arc::new(|a: &Workflow, b: &Workflow| {
          a.name.cmp(&b.name).then(a.id.cmp(&b.id))
        })),
        first_sync_failures: self.first_sync_failures,
      },
    );

    self.scheduler.schedule(collection, ChangeFeed::new(), None)
  }

  /// Poll one run with a bounded attempt budget, e.g. until it
  /// completes. Uses the last-modified validator: single resources are
  /// cheap to re-ask by timestamp. Watching the same run again restarts
  /// the budget.
  pub fn watch_run(&self, run_id: u64, attempts: u32) -> ScheduledSync<u64, WorkflowRun> {
    let params = GetRunParams {
      owner: self.owner.clone(),
      repo: self.repo.clone(),
      run_id,
    };
    let cache_id = format!("getWorkflowRun-{run_id}");
    let query_key = vec![
      "run".to_string(),
      format!("{}/{}", self.owner, self.repo),
      run_id.to_string(),
    ];

    let client = self.client.clone();
    let gateway = Arc::clone(&self.gateway);
    let collection = CollectionSync::with_options(
      query_key,
      move || {
        let client = client.clone();
        let gateway = Arc::clone(&gateway);
        let params = params.clone();
        let cache_id = cache_id.clone();
        async move {
          let fetched = gateway
            .conditional(
              Some(&cache_id),
              ValidatorKind::Timestamp,
              params,
              |p, pre| {
                let client = client.clone();
                async move { client.get_workflow_run(&p, pre).await }
              },
            )
            .await?;
          match fetched {
            Fetched::Unchanged => Ok(Fetched::Unchanged),
            Fetched::Changed(response) => {
              let run = select_single_run(response.data)
                .map_err(|e| SyncError::Malformed(format!("workflow run payload: {e}")))?;
              Ok(Fetched::Changed(run))
            }
          }
        }
      },
      |run: &WorkflowRun| run.id,
      SyncOptions {
        comparator: None,
        first_sync_failures: self.first_sync_failures,
      },
    );

    self
      .scheduler
      .schedule(collection, ChangeFeed::new(), Some(attempts))
  }

  /// Stop every poll loop this mirror started.
  pub fn shutdown(&self) {
    self.scheduler.shutdown();
  }
}

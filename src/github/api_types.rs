//! Serde-deserializable types matching Actions API responses, and the
//! selectors that turn raw payloads into domain types.
//!
//! These types are separate from domain types to allow clean
//! deserialization while keeping domain types focused on what the
//! mirror actually tracks.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::types::{Workflow, WorkflowJob, WorkflowRun, WorkflowStep};

// ============================================================================
// Workflow runs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiWorkflowRunsResponse {
  #[serde(default)]
  pub total_count: u64,
  #[serde(default)]
  pub workflow_runs: Vec<ApiWorkflowRun>,
}

#[derive(Debug, Deserialize)]
pub struct ApiWorkflowRun {
  pub id: u64,
  pub name: Option<String>,
  pub workflow_id: u64,
  #[serde(default)]
  pub run_number: u64,
  pub run_attempt: Option<u32>,
  #[serde(default)]
  pub event: String,
  pub status: Option<String>,
  pub conclusion: Option<String>,
  pub head_branch: Option<String>,
  #[serde(default)]
  pub head_sha: String,
  #[serde(default)]
  pub html_url: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl ApiWorkflowRun {
  pub fn into_run(self) -> WorkflowRun {
    WorkflowRun {
      id: self.id,
      name: self.name,
      workflow_id: self.workflow_id,
      run_number: self.run_number,
      run_attempt: self.run_attempt.unwrap_or(1),
      event: self.event,
      status: self.status,
      conclusion: self.conclusion,
      head_branch: self.head_branch,
      head_sha: self.head_sha,
      html_url: self.html_url,
      created_at: self.created_at,
      updated_at: self.updated_at,
    }
  }
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiJobsResponse {
  #[serde(default)]
  pub total_count: u64,
  #[serde(default)]
  pub jobs: Vec<ApiWorkflowJob>,
}

#[derive(Debug, Deserialize)]
pub struct ApiWorkflowJob {
  pub id: u64,
  pub run_id: u64,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub status: String,
  pub conclusion: Option<String>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub steps: Vec<ApiWorkflowStep>,
}

#[derive(Debug, Deserialize)]
pub struct ApiWorkflowStep {
  #[serde(default)]
  pub number: u32,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub status: String,
  pub conclusion: Option<String>,
}

impl ApiWorkflowJob {
  pub fn into_job(self) -> WorkflowJob {
    WorkflowJob {
      id: self.id,
      run_id: self.run_id,
      name: self.name,
      status: self.status,
      conclusion: self.conclusion,
      started_at: self.started_at,
      completed_at: self.completed_at,
      steps: self
        .steps
        .into_iter()
        .map(|step| WorkflowStep {
          number: step.number,
          name: step.name,
          status: step.status,
          conclusion: step.conclusion,
        })
        .collect(),
    }
  }
}

// ============================================================================
// Workflows
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiWorkflowsResponse {
  #[serde(default)]
  pub total_count: u64,
  #[serde(default)]
  pub workflows: Vec<ApiWorkflow>,
}

#[derive(Debug, Deserialize)]
pub struct ApiWorkflow {
  pub id: u64,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub path: String,
  #[serde(default)]
  pub state: String,
}

impl ApiWorkflow {
  pub fn into_workflow(self) -> Workflow {
    Workflow {
      id: self.id,
      name: self.name,
      path: self.path,
      state: self.state,
    }
  }
}

// ============================================================================
// Selectors
// ============================================================================

pub fn select_workflow_runs(raw: Value) -> serde_json::Result<Vec<WorkflowRun>> {
  let response: ApiWorkflowRunsResponse = serde_json::from_value(raw)?;
  Ok(
    response
      .workflow_runs
      .into_iter()
      .map(ApiWorkflowRun::into_run)
      .collect(),
  )
}

/// A single run fetched by id, presented as a one-element set.
pub fn select_single_run(raw: Value) -> serde_json::Result<Vec<WorkflowRun>> {
  let run: ApiWorkflowRun = serde_json::from_value(raw)?;
  Ok(vec![run.into_run()])
}

pub fn select_run_jobs(raw: Value) -> serde_json::Result<Vec<WorkflowJob>> {
  let response: ApiJobsResponse = serde_json::from_value(raw)?;
  Ok(
    response
      .jobs
      .into_iter()
      .map(ApiWorkflowJob::into_job)
      .collect(),
  )
}

pub fn select_workflows(raw: Value) -> serde_json::Result<Vec<Workflow>> {
  let response: ApiWorkflowsResponse = serde_json::from_value(raw)?;
  Ok(
    response
      .workflows
      .into_iter()
      .map(ApiWorkflow::into_workflow)
      .collect(),
  )
}

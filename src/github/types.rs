use chrono::{DateTime, Utc};

/// A workflow run as mirrored from the Actions API.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
  pub id: u64,
  pub name: Option<String>,
  pub workflow_id: u64,
  pub run_number: u64,
  pub run_attempt: u32,
  pub event: String,
  /// "queued", "in_progress", "completed", ...
  pub status: Option<String>,
  /// "success", "failure", "cancelled", ... once completed
  pub conclusion: Option<String>,
  pub head_branch: Option<String>,
  pub head_sha: String,
  pub html_url: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
  pub fn is_complete(&self) -> bool {
    self.status.as_deref() == Some("completed")
  }

  /// Workflow name, falling back to the run number.
  pub fn display_name(&self) -> String {
    match &self.name {
      Some(name) => name.clone(),
      None => format!("run #{}", self.run_number),
    }
  }
}

/// A job within a workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowJob {
  pub id: u64,
  pub run_id: u64,
  pub name: String,
  pub status: String,
  pub conclusion: Option<String>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub steps: Vec<WorkflowStep>,
}

/// A step within a job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStep {
  pub number: u32,
  pub name: String,
  pub status: String,
  pub conclusion: Option<String>,
}

/// A workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
  pub id: u64,
  pub name: String,
  pub path: String,
  /// "active", "disabled_manually", ...
  pub state: String,
}

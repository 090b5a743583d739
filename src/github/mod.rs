//! GitHub Actions domain layer: typed entities, the request functions
//! the gateway drives, and the scheduled mirrors built on the sync
//! engine.

pub mod api_types;
pub mod client;
pub mod mirror;
pub mod types;

pub use client::{ActionsClient, RateLimit};
pub use mirror::{ActionsMirror, WATCH_RUN_ATTEMPTS};
pub use types::{Workflow, WorkflowJob, WorkflowRun, WorkflowStep};

//! Local, incrementally updated mirrors of GitHub Actions state.
//!
//! The [`sync`] module is the generic engine: conditional-request
//! caching, keyed snapshots with typed diffs, polling with adaptive
//! backoff, and change fan-out. The [`github`] module binds it to the
//! Actions REST API (workflow runs, jobs, workflow definitions) for one
//! repository. Consumers read snapshots through scheduled handles after
//! the first sync and subscribe to change feeds for updates.

pub mod config;
pub mod error;
pub mod github;
pub mod sync;

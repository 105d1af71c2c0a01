//! Service Module
//!
//! Job lifecycle: request resolution, pipeline orchestration, event
//! journaling and subscriptions.

pub mod feed;
pub mod job;
pub mod journal;
pub mod pipeline;
pub mod resolve;

pub use job::{JobError, JobService};

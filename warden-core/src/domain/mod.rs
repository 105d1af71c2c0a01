//! Core domain types
//!
//! These types represent the entities the engine persists (jobs, events) and
//! the declarative inputs it executes (pipelines, security policy).

pub mod event;
pub mod job;
pub mod pipeline;
pub mod policy;

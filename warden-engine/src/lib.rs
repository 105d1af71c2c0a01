pub mod broadcast;
pub mod config;
pub mod db;
pub mod gate;
pub mod notifier;
pub mod policy;
pub mod protocol;
pub mod registry;
pub mod repository;
pub mod sandbox;
pub mod service;

pub use config::EngineConfig;
pub use service::{JobError, JobService};

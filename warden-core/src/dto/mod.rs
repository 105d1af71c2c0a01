//! Data Transfer Objects
//!
//! Requests accepted by the engine and the partial updates / filters it
//! exchanges with the job store.

pub mod job;

//! Warden Core
//!
//! Core types shared by the Warden job engine and its operator tooling.
//!
//! This crate contains:
//! - Domain types: jobs, job events, pipelines and the sandbox security policy
//! - DTOs: start requests, job patches and list filters exchanged with the store

pub mod domain;
pub mod dto;

//! Kudu Core
//!
//! Core types shared by the Kudu WebJobs coordinator crates.
//!
//! This crate contains:
//! - Domain types: jobs, job settings, triggered runs, web hooks, deployments
//! - DTOs: request/response shapes exchanged with callers and job endpoints

pub mod domain;
pub mod dto;

//! Data Transfer Objects
//!
//! Lightweight request/response shapes used at the edges of the coordinator:
//! invocation results, run history pages and proxied HTTP requests.

pub mod job;
pub mod proxy;

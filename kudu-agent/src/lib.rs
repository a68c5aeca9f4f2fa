//! Kudu Agent
//!
//! Cooperative, file-lock based coordinator for WebJobs and deployment hooks.
//!
//! Architecture:
//! - Configuration: `Config` from environment or defaults, `Environment` paths
//! - File system: `FileSystem` trait with OS and in-memory implementations
//! - Locks: named `OperationLock`s (OS advisory lock or lease marker file)
//! - Jobs: one `JobsManager` per kind and source, aggregated; triggered runs
//!   and the continuous job supervisor on top
//! - Scheduler: polling loop firing cron-scheduled triggered jobs
//! - Hooks: persisted web hook registry and post-deployment publishing
//! - Services: process execution and HTTP pass-through seams
//!
//! Every manager is created once by [`site::Site`] and shared through `Arc`.

pub mod config;
pub mod environment;
pub mod error;
pub mod fs;
pub mod hooks;
pub mod jobs;
pub mod lock;
pub mod scheduler;
pub mod service;
pub mod site;

pub use config::{Config, LockBackend};
pub use environment::Environment;
pub use error::{CoordinatorError, Result};
pub use site::Site;

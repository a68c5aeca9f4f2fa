//! Service layer
//!
//! Seams between the job managers and the outside world: running job
//! processes and forwarding HTTP requests to jobs that expose an endpoint.
//!
//! All services are trait-based so managers can be tested with fakes.

mod endpoint;
mod execution;

// Re-export traits
pub use endpoint::JobEndpoint;
pub use execution::{JobExecutor, OutputSink};

// Re-export implementations and request types
pub use execution::{ExecutionRequest, ExitOutcome, ProcessExecutor};

#[cfg(test)]
pub(crate) use execution::testing;

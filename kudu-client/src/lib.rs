//! Kudu HTTP Clients
//!
//! Outbound HTTP used by the coordinator:
//! - [`HookClient`] delivers web hook notifications (JSON POST)
//! - [`JobEndpointClient`] forwards requests to continuous jobs listening on
//!   a local port
//!
//! # Example
//!
//! ```no_run
//! use kudu_client::HookClient;
//! use std::time::Duration;
//!
//! # async fn example() -> kudu_client::Result<()> {
//! let client = HookClient::new(Duration::from_secs(10))?;
//! let response = client
//!     .post_json("https://example.com/hook", &serde_json::json!({"id": "1"}), false)
//!     .await?;
//! println!("delivered: {}", response.reason);
//! # Ok(())
//! # }
//! ```

mod endpoint;
pub mod error;
mod hooks;

pub use endpoint::JobEndpointClient;
pub use error::{ClientError, Result};
pub use hooks::{HookClient, HookResponse};

/// User agent sent with every outbound request
pub const USER_AGENT: &str = concat!("kudu/", env!("CARGO_PKG_VERSION"));

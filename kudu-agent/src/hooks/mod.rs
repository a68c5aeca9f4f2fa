//! Web hooks
//!
//! [`WebHooksManager`] keeps the persisted hook registry and notifies hooks
//! after deployments through a [`HookPublisher`].

mod manager;
mod publisher;

pub use manager::{PublishPolicy, WebHooksManager};

// Re-export traits
pub use publisher::HookPublisher;

#[cfg(test)]
pub(crate) use publisher::testing as publisher_testing;

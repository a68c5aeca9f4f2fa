//! Core domain types
//!
//! These types describe what lives on disk under a site root and are shared
//! between the agent (which persists and mutates them) and the CLI/clients
//! (which read them).

pub mod deployment;
pub mod hook;
pub mod job;
pub mod run;
pub mod settings;

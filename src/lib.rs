//! Persistence and synchronization core of a cloud development sandbox.
//!
//! Keeps per-project working copies in step with their git remotes,
//! reconciles the editor workspace manifest against the filesystem, and
//! backs everything up when the sandbox is torn down.

pub mod config;
pub mod credentials;
pub mod daemon;
pub mod error;
pub mod git;
pub mod lock;
pub mod orchestrator;
pub mod paths;
pub mod protocol;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use error::{Result, SandboxError};
pub use orchestrator::Sandbox;

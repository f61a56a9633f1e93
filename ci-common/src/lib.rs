// Shared helpers used across the CI orchestrator crates.

#[macro_use]
extern crate anyhow;

pub mod fs;
pub mod http;
pub mod jitter;
pub mod process;
pub mod secret;

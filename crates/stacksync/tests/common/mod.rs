//! Shared test utilities for stacksync integration tests.
//!
//! This module provides:
//! - `SyncHarness` for running sync passes against a temp manifest directory
//! - Builders for manifests and application files

pub mod builders;
pub mod harness;

#[allow(unused_imports)]
pub use builders::*;
#[allow(unused_imports)]
pub use harness::{wait_for, SyncHarness};

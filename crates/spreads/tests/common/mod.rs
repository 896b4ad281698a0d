//! Shared test utilities for spreads integration tests.
//!
//! This module provides:
//! - `TestHarness` with an engine rooted in a temp directory
//! - a mock driver and recording hook plugins

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{HarnessBuilder, TestHarness};

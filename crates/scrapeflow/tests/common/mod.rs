//! Shared test utilities for scrapeflow integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated orchestrator runs in temp directories
//! - `FakeRunner` and `MemoryObjectStore` doubles
//! - Builder patterns for test configurations

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{FakeRunner, MemoryObjectStore, TestHarness};

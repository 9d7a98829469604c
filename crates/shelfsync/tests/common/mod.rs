//! Shared test utilities for shelfsync integration tests.
//!
//! - `FakeIndex`: scripted in-memory stand-in for the remote index
//! - `TestHarness`: temp library directory plus a state store wired to the fake

pub mod fake_index;
pub mod harness;

pub use fake_index::{FakeIndex, OpScript};
pub use harness::TestHarness;

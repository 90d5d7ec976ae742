//! Shared test utilities for drawdiff integration tests.
//!
//! - `TestHarness` wires a runner to a temporary database and object store
//! - `builders` draws synthetic drawing pages

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;

//! Shared types for the LLM stack test harness
//!
//! Contains only the types that cross component boundaries: role and
//! lifecycle enums for the supervised backend chain, the test case and
//! result records, and the logging utilities used by every binary.

pub mod errors;
pub mod logging;
pub mod types;

pub use errors::*;
pub use types::*;

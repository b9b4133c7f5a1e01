//! Shared error types for the test harness

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Invalid URL: {input}")]
    InvalidUrl { input: String },
}

pub type SharedResult<T> = Result<T, SharedError>;

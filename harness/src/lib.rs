//! Black-box test harness for a three-stage inference backend
//!
//! The harness supervises a CONTROLLER -> WORKER -> GATEWAY process chain
//! (port arbitration, readiness polling, rollback, teardown) and then
//! drives an ordered batch of chat test cases against the gateway,
//! producing one classified result per case.

pub mod config;
pub mod core;
pub mod error;
pub mod services;
pub mod traits;

pub use config::{ExecutorConfig, StackConfig};
pub use error::{HarnessError, HarnessResult, RequestErrorKind};
pub use services::{
    FastChatLauncher, JsonCaseSource, JsonResultsSink, MockStackLauncher, StackSupervisor,
    TestExecutor,
};

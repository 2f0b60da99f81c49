//! Configuration and error types shared across the crate

pub mod config;
pub mod error;

pub use config::{Config, CoordinatorConfig, DuplicateRule, RetryPolicy};
pub use error::{Error, OperationFailure, Result};

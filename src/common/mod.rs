//! Shared infrastructure: errors, logging, environment contract

pub mod env;
pub mod error;
pub mod logging;

pub use error::{Error, Result};

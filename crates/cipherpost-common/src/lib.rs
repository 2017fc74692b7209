//! Cipherpost Common - Shared types and configuration
//!
//! This crate provides the configuration model, the error taxonomy and the
//! small value types shared by the gateway core and the executable.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{Disposition, FailureMode, KeyRef};

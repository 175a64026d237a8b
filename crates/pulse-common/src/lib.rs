//! Pulse Common Types
//!
//! This crate provides the error taxonomy and environment-driven
//! configuration shared by the Pulse server and CLI.

pub mod config;
pub mod error;

pub use config::Config;
pub use error::{PulseError, Result};

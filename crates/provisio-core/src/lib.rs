//! Provisio Core Library
//!
//! Shared functionality for Provisio components:
//! - Provisioning request payload and upstream validation
//! - Settings resolution (defaults, settings file, environment)
//! - `SQLite` pool helpers for the durable task queue
//! - Common error types and tracing setup

pub mod config;
pub mod db;
pub mod error;
pub mod request;
pub mod tracing_init;

pub use config::Settings;
pub use error::{Error, Result};
pub use request::{ProvisioningRequest, ValidationError};

//! Common error types for periphery.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.
//! Individual drivers report their own chip-specific errors through
//! `anyhow`, the same way the bus traits report [`HwError`].

use thiserror::Error;

use crate::hw_trait::HwError;

/// Main error type for periphery operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bus or port errors
    #[error("Hardware error: {0}")]
    Hardware(#[from] HwError),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device attachment or driver errors
    #[error("Device error: {0}")]
    Device(String),

    /// API errors
    #[error("API error: {0}")]
    Api(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

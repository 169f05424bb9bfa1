//! Error types for Medir
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for Medir operations
pub type Result<T> = std::result::Result<T, MedirError>;

/// Error type for all Medir operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MedirError {
    /// Tensor element type outside the supported closed set
    #[error("{name}: unsupported dtype {dtype}")]
    UnsupportedDtype {
        /// Tensor name
        name: String,
        /// Declared element type
        dtype: String,
    },

    /// Tensor byte buffer inconsistent with its declared element type
    #[error("{name}: {reason}")]
    MalformedTensor {
        /// Tensor name
        name: String,
        /// Reason for rejection
        reason: String,
    },

    /// Archive open/read failure
    #[error("I/O error: {message}")]
    Io {
        /// Underlying failure description
        message: String,
    },

    /// HuggingFace hub request failure
    #[error("HTTP error: {message}")]
    Http {
        /// Underlying failure description
        message: String,
    },

    /// Bad CLI arguments or repository reference
    #[error("Invalid configuration: {message}")]
    Config {
        /// What was wrong with the input
        message: String,
    },

    /// Analysis document (de)serialization failure
    #[error("JSON error: {message}")]
    Json {
        /// Underlying failure description
        message: String,
    },

    /// The driver was cancelled before completion
    #[error("cancelled")]
    Cancelled,
}

impl MedirError {
    /// Build an [`MedirError::Io`] from any displayable source.
    pub fn io(e: impl std::fmt::Display) -> Self {
        Self::Io {
            message: e.to_string(),
        }
    }
}

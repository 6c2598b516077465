//! Unified error types for Nimbus

use thiserror::Error;

/// Unified error type for all Nimbus operations
#[derive(Error, Debug)]
pub enum NimbusError {
    // Ingestion errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // Agent errors
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("State persistence error: {0}")]
    Persistence(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl NimbusError {
    /// Whether the caller sent something unacceptable (as opposed to a server fault)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }
}

/// Result type alias using NimbusError
pub type Result<T> = std::result::Result<T, NimbusError>;

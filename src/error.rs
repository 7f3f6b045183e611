/// Centralized error types for the synchronization engine
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    // Request Errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Data Errors
    #[error("No data available: {0}")]
    NoData(String),

    #[error("Sync timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // Storage Errors
    #[error("File I/O error: {0}")]
    File(#[from] std::io::Error),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Check if retrying the same request may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::NoData(_) | SyncError::Timeout(_))
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            SyncError::InvalidRequest(_) => "REQ_001",
            SyncError::NoData(_) => "DATA_001",
            SyncError::Timeout(_) => "DATA_002",
            SyncError::Serialization(_) => "DATA_003",
            SyncError::File(_) => "FILE_001",
            SyncError::Config(_) => "CFG_001",
        }
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(e: config::ConfigError) -> Self {
        SyncError::Config(e.to_string())
    }
}

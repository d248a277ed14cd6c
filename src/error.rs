/// Centralized error types for the bar feed
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    // Structural Errors
    #[error("Invalid bar interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),

    #[error("Invalid adjustment ranges: {0}")]
    InvalidAdjustments(String),

    #[error("No timeframe subscribed: {0}")]
    NoTimeframes(String),

    // Resolution Errors
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Instrument not found: {0}")]
    InstrumentNotFound(String),

    // Storage Errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage timeout: {0}")]
    StorageTimeout(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Lifecycle
    #[error("Replay cancelled: {0}")]
    Cancelled(String),

    // Generic Errors
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FeedError>;

impl FeedError {
    /// Transient conditions a caller may retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FeedError::ExchangeNotFound(_)
                | FeedError::InstrumentNotFound(_)
                | FeedError::StorageTimeout(_)
                | FeedError::Storage(_)
                | FeedError::MissingData(_)
        )
    }

    /// Configuration bugs: never retried, always surfaced
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FeedError::InvalidInterval(_)
                | FeedError::InvalidTimeframe(_)
                | FeedError::InvalidAdjustments(_)
                | FeedError::NoTimeframes(_)
                | FeedError::ConfigError(_)
        )
    }

    /// Check if error should stop the whole run
    pub fn is_fatal(&self) -> bool {
        self.is_structural() || matches!(self, FeedError::InternalError(_))
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            FeedError::InvalidInterval(_) => "STRUCT_001",
            FeedError::InvalidTimeframe(_) => "STRUCT_002",
            FeedError::InvalidAdjustments(_) => "STRUCT_003",
            FeedError::NoTimeframes(_) => "STRUCT_004",
            FeedError::ExchangeNotFound(_) => "RES_001",
            FeedError::InstrumentNotFound(_) => "RES_002",
            FeedError::Storage(_) => "IO_001",
            FeedError::StorageTimeout(_) => "IO_002",
            FeedError::MissingData(_) => "IO_003",
            FeedError::FileError(_) => "FILE_001",
            FeedError::CsvError(_) => "FILE_002",
            FeedError::DeserializationError(_) => "FILE_003",
            FeedError::ConfigError(_) => "CFG_001",
            FeedError::Cancelled(_) => "SYS_001",
            FeedError::InternalError(_) => "INT_001",
            FeedError::Other(_) => "GEN_001",
        }
    }
}

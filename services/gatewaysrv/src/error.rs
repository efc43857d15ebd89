//! Error handling for the gateway service
//!
//! A single consolidated error enum keeps the surface small; callers that need
//! finer context attach it through the message payload.

use thiserror::Error;

/// Gateway service error type
#[derive(Error, Debug, Clone)]
pub enum GatewaySrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Field-protocol communication errors (S7, OPC UA, Modbus)
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Connection establishment and maintenance errors (includes NotConnected)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Data handling errors (parsing, conversion, validation)
    #[error("Data error: {0}")]
    DataError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Storage errors (SQLite)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Device errors (not found, already exists)
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Variable errors (unknown address, bad table)
    #[error("Variable error: {0}")]
    VariableError(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the gateway service
pub type Result<T> = std::result::Result<T, GatewaySrvError>;

impl GatewaySrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        GatewaySrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        GatewaySrvError::IoError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        GatewaySrvError::ProtocolError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        GatewaySrvError::ConnectionError(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        GatewaySrvError::DataError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        GatewaySrvError::TimeoutError(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        GatewaySrvError::StorageError(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        GatewaySrvError::DeviceError(msg.into())
    }

    pub fn variable(msg: impl Into<String>) -> Self {
        GatewaySrvError::VariableError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        GatewaySrvError::InternalError(msg.into())
    }

    /// Whether the error is a transient I/O class failure that should be
    /// isolated to the owning device/broker rather than propagated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewaySrvError::IoError(_)
                | GatewaySrvError::ConnectionError(_)
                | GatewaySrvError::TimeoutError(_)
                | GatewaySrvError::ProtocolError(_)
        )
    }
}

impl From<std::io::Error> for GatewaySrvError {
    fn from(e: std::io::Error) -> Self {
        GatewaySrvError::IoError(e.to_string())
    }
}

impl From<sqlx::Error> for GatewaySrvError {
    fn from(e: sqlx::Error) -> Self {
        GatewaySrvError::StorageError(e.to_string())
    }
}

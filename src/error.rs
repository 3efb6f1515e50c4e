//! Error types for parlance.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParlanceError {
    // Configuration
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Capability errors
    #[error("Capability '{name}' unavailable: {message}")]
    CapabilityUnavailable { name: String, message: String },

    #[error("Capability '{stage}' exceeded its {budget_ms} ms budget")]
    CapabilityTimeout { stage: &'static str, budget_ms: u64 },

    #[error("Transcription failed: {message}")]
    Transcription { message: String },

    #[error("Translation failed: {message}")]
    Translation { message: String },

    #[error("Speech synthesis failed: {message}")]
    Synthesis { message: String },

    // Audio stream errors
    #[error("Audio decode failed: {message}")]
    Decode { message: String },

    // Room errors
    #[error("Room {code} not found")]
    RoomNotFound { code: String },

    #[error("Room {code} is full")]
    RoomFull { code: String },

    #[error("Bad request: {message}")]
    BadRequest { message: String },

    // Connection errors
    #[error("Outbound queue overflow, client too slow")]
    Backpressure,

    #[error("Transport error: {message}")]
    Transport { message: String },

    // I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result shorthand
pub type Result<T> = std::result::Result<T, ParlanceError>;

/// Wire-visible error taxonomy carried in `error` JSON payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CapabilityUnavailable,
    BadRequest,
    RoomNotFound,
    RoomFull,
    CapabilityTimeout,
    Backpressure,
    ProtocolViolation,
    TransportClosed,
}

impl ParlanceError {
    /// Maps an error onto the wire taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParlanceError::CapabilityUnavailable { .. } => ErrorKind::CapabilityUnavailable,
            ParlanceError::CapabilityTimeout { .. } => ErrorKind::CapabilityTimeout,
            ParlanceError::RoomNotFound { .. } => ErrorKind::RoomNotFound,
            ParlanceError::RoomFull { .. } => ErrorKind::RoomFull,
            ParlanceError::BadRequest { .. }
            | ParlanceError::ConfigInvalidValue { .. } => ErrorKind::BadRequest,
            ParlanceError::Backpressure => ErrorKind::Backpressure,
            ParlanceError::Transport { .. } => ErrorKind::TransportClosed,
            _ => ErrorKind::ProtocolViolation,
        }
    }

    /// True when the session can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ParlanceError::CapabilityTimeout { .. }
                | ParlanceError::Transcription { .. }
                | ParlanceError::Translation { .. }
                | ParlanceError::Synthesis { .. }
                | ParlanceError::Decode { .. }
        )
    }
}

//! Error types shared across the broker crates.

use thiserror::Error;

/// Main error type for broker operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or empty topic string
    #[error("Invalid topic: {message}")]
    InvalidTopic {
        /// What was wrong with the topic
        message: String,
    },

    /// Wire-level encoding or decoding failure
    #[error("Wire format error: {message}")]
    Wire {
        /// Decoder/encoder diagnostic
        message: String,
    },

    /// A frame exceeded the configured maximum size
    #[error("Frame of {actual} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Observed frame size
        actual: usize,
        /// Configured ceiling
        max: usize,
    },

    /// Configuration loading or validation failure
    #[error("Configuration error: {message}")]
    Configuration {
        /// Offending key or parse diagnostic
        message: String,
    },

    /// Transport-level failure (connect, handshake, link management)
    #[error("Network error: {message}")]
    Network {
        /// Transport diagnostic
        message: String,
    },

    /// A store read was attempted while the clone is not in sync
    #[error("Store contents not available (clone out of sync)")]
    Unavailable,

    /// The actor behind a handle has shut down
    #[error("Endpoint or store has shut down")]
    Detached,

    /// Standard I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a wire format error from any displayable diagnostic.
    pub fn wire<T: std::fmt::Display>(message: T) -> Self {
        Self::Wire { message: message.to_string() }
    }

    /// Create a configuration error from any displayable diagnostic.
    pub fn configuration<T: std::fmt::Display>(message: T) -> Self {
        Self::Configuration { message: message.to_string() }
    }

    /// Create a network error from any displayable diagnostic.
    pub fn network<T: std::fmt::Display>(message: T) -> Self {
        Self::Network { message: message.to_string() }
    }
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, Error>;

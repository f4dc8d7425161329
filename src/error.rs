use thiserror::Error;
use uuid::Uuid;

use crate::protocol::SequenceGap;

/// Errors that can occur when working with a mower over BLE or the cloud relay
#[derive(Error, Debug)]
pub enum MowerError {
    /// Bluetooth Low Energy adapter errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Link failure while talking to the device
    #[error("Transport error: {0}")]
    Transport(String),

    /// Device not found during scanning
    #[error("Mower not found")]
    DeviceNotFound,

    /// No link is established
    #[error("Device disconnected")]
    Disconnected,

    /// A wireless frame could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Received sequence number differs from the expected one
    #[error("Sequence gap: expected {expected}, observed {observed}")]
    SequenceGap {
        /// Sequence number the receiver expected
        expected: u8,
        /// Sequence number actually received
        observed: u8,
    },

    /// The write or notify endpoint is missing on the connected device
    #[error("Endpoint {0} not found on device")]
    EndpointMissing(Uuid),

    /// A pending call was not resolved in time
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The vendor gateway answered with a non-200 code
    #[error("Gateway error {code}: {message}")]
    Gateway {
        /// Application-level response code
        code: i64,
        /// Server message, verbatim
        message: String,
    },

    /// A cloud handshake step returned an unusable response
    #[error("Handshake failed at {step}: {reason}")]
    Handshake {
        /// Name of the failing step
        step: &'static str,
        /// What was wrong with the response
        reason: String,
    },

    /// No cloud session has been established
    #[error("No cloud session established")]
    NoSession,

    /// More than one field group is populated in a single message
    #[error("Ambiguous message: {0} populated field groups")]
    AmbiguousMessage(usize),

    /// The application message codec failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// No catalog entry exists for the command key
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Invalid command parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Result type for mower operations
pub type Result<T> = std::result::Result<T, MowerError>;

impl From<SequenceGap> for MowerError {
    fn from(gap: SequenceGap) -> Self {
        Self::SequenceGap {
            expected: gap.expected,
            observed: gap.observed,
        }
    }
}

impl MowerError {
    /// Check if this error indicates a link failure that must tear the connection down
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(self, Self::Ble(_) | Self::Transport(_) | Self::Disconnected)
    }

    /// Check if this error leaves the connection usable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::MalformedFrame(_)
                | Self::SequenceGap { .. }
                | Self::AmbiguousMessage(_)
                | Self::InvalidParameters(_)
                | Self::UnknownCommand(_)
        )
    }

    /// Check if this error is purely diagnostic
    #[must_use]
    pub const fn is_diagnostic(&self) -> bool {
        matches!(self, Self::SequenceGap { .. })
    }

    /// Check if the cloud rejected our credentials
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::Gateway {
                code: 401 | 2401 | 29003,
                ..
            } | Self::NoSession
        )
    }
}

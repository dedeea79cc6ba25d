//! I/O Gateway Error Types
//!
//! Decode errors never abort ingestion: they are returned for the offending
//! frame only. Command errors are returned per call so callers can tell a
//! silent device (`Timeout`) apart from a failed publish (`TransportRejected`).

use thiserror::Error;

/// Result type for frame decoding
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Result type for command operations
pub type CommandResult<T> = std::result::Result<T, CommandError>;

/// Frame decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the fixed envelope header and trailer
    #[error("Frame too short: {len} bytes (min {min})")]
    TooShort { len: usize, min: usize },

    /// Start/end marker pair matches no supported wire variant
    #[error("Bad frame marker: start={start:#04X}, end={end:#04X}")]
    BadMarker { start: u8, end: u8 },

    /// Declared body length disagrees with the bytes present
    #[error("Length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// A fixed report field runs past the end of the body
    #[error("Truncated at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Payload type byte has no report decoder
    #[error("Unsupported report type: {0:#04X}")]
    UnsupportedReportType(u8),

    /// Legacy hex payload is not valid hex text
    #[error("Invalid hex payload: {0}")]
    InvalidHex(String),
}

/// Command frame construction errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// No password configured for the device
    #[error("No password configured")]
    MissingPassword,

    #[error("Invalid password: {0}")]
    InvalidPassword(String),

    /// Output index outside 1..=2
    #[error("Invalid output index: {0}")]
    InvalidOutput(u8),

    /// Counter index outside 1..=4
    #[error("Invalid counter index: {0}")]
    InvalidCounter(u8),

    #[error("Invalid pulse duration: {0}")]
    InvalidPulse(String),

    /// Frame bytes do not describe a command (used by the decode side)
    #[error("Malformed command frame: {0}")]
    Malformed(String),
}

/// Transport publish failure reported by the transport collaborator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Publish to {topic} failed: {reason}")]
pub struct TransportError {
    pub topic: String,
    pub reason: String,
}

impl TransportError {
    pub fn new(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

/// Command session errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Device session has not completed the password handshake
    #[error("Device {0} is not authenticated")]
    NotAuthenticated(String),

    #[error("Command build failed: {0}")]
    BuildFailure(#[from] BuildError),

    /// No matching response before the deadline
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The transport refused the publish
    #[error("Transport rejected command: {0}")]
    TransportRejected(#[from] TransportError),

    /// A response arrived but its body could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl CommandError {
    /// Whether the caller may reasonably try again later.
    ///
    /// Retries are never issued by the session itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CommandError::Timeout(_) | CommandError::TransportRejected(_)
        )
    }
}

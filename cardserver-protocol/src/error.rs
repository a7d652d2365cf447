//! Error types for the card server protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame-level errors of the remote transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Invalid magic bytes in frame header.
    #[error("Invalid magic bytes: expected 'DVBC', got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Message type is unknown or unsupported.
    #[error("Unknown message type: 0x{0:04X}")]
    UnknownMessageType(u16),

    /// Frame payload is too large.
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u32, u32),

    /// Frame payload is incomplete.
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Failed to decode message payload.
    #[error("Failed to decode message: {0}")]
    DecodeError(String),

    /// Failed to encode message payload.
    #[error("Failed to encode message: {0}")]
    EncodeError(String),

    /// Message type in the header does not match the payload.
    #[error("Message type mismatch: header=0x{header:04X}, payload=0x{payload:04X}")]
    TypeMismatch { header: u16, payload: u16 },

    /// Underlying stream failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e.to_string())
    }
}

/// Kind of a card server fault.
///
/// Every kind has a stable code used on the wire and in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum FaultKind {
    /// Unclassified failure.
    Unknown = 0x0001,
    /// The requested profile does not exist.
    ProfileNotFound = 0x0002,
    /// A selection belongs to another profile.
    ProfileMismatch = 0x0003,
    /// A profile is already attached to this server.
    ProfileAlreadyAttached = 0x0004,
    /// No profile attached yet.
    ProfileNotAttached = 0x0005,
    /// Another request is still outstanding.
    ServerBusy = 0x0006,
    /// The source is already being received with this correlation id.
    SourceInUse = 0x0007,
    /// No active stream for the source and correlation id.
    NoSuchSource = 0x0008,
    /// Program guide collection is running.
    EpgActive = 0x0009,
    /// Program guide collection is not running.
    EpgNotActive = 0x000A,
    /// A transponder scan is running.
    ScanActive = 0x000B,
    /// No transponder scan is running.
    ScanNotActive = 0x000C,
    /// The profile has no own source list.
    NoSourceList = 0x000D,
    /// No custom action with the given name.
    NoSuchAction = 0x000E,
    /// No extension factory for the payload.
    NoSuchExtension = 0x000F,
    /// Invalid request parameter.
    Validation = 0x0010,
    /// The device or one of its collaborators failed.
    Device = 0x0011,
    /// The remote transport failed.
    Transport = 0x0012,
    /// Malformed message or unexpected response shape.
    Protocol = 0x0013,
    /// The request was dropped without a result.
    Abandoned = 0x0014,
    /// The result has already been retrieved.
    ResultConsumed = 0x0015,
}

impl FaultKind {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl From<u16> for FaultKind {
    fn from(value: u16) -> Self {
        match value {
            0x0002 => FaultKind::ProfileNotFound,
            0x0003 => FaultKind::ProfileMismatch,
            0x0004 => FaultKind::ProfileAlreadyAttached,
            0x0005 => FaultKind::ProfileNotAttached,
            0x0006 => FaultKind::ServerBusy,
            0x0007 => FaultKind::SourceInUse,
            0x0008 => FaultKind::NoSuchSource,
            0x0009 => FaultKind::EpgActive,
            0x000A => FaultKind::EpgNotActive,
            0x000B => FaultKind::ScanActive,
            0x000C => FaultKind::ScanNotActive,
            0x000D => FaultKind::NoSourceList,
            0x000E => FaultKind::NoSuchAction,
            0x000F => FaultKind::NoSuchExtension,
            0x0010 => FaultKind::Validation,
            0x0011 => FaultKind::Device,
            0x0012 => FaultKind::Transport,
            0x0013 => FaultKind::Protocol,
            0x0014 => FaultKind::Abandoned,
            0x0015 => FaultKind::ResultConsumed,
            _ => FaultKind::Unknown,
        }
    }
}

impl From<FaultKind> for u16 {
    fn from(value: FaultKind) -> Self {
        value as u16
    }
}

/// The single error type reported for a failed card server request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardServerFault {
    pub kind: FaultKind,
    pub message: String,
}

impl std::fmt::Display for CardServerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:04X}): {}", self.kind, self.kind.code(), self.message)
    }
}

impl std::error::Error for CardServerFault {}

impl CardServerFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Validation, message)
    }

    pub fn busy() -> Self {
        Self::new(FaultKind::ServerBusy, "a previous request has not completed yet")
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Device, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Transport, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Protocol, message)
    }
}

impl From<ProtocolError> for CardServerFault {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(message) => CardServerFault::transport(message),
            other => CardServerFault::protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_codes_are_stable() {
        for code in 0x0001..=0x0015u16 {
            assert_eq!(FaultKind::from(code).code(), code);
        }
        assert_eq!(FaultKind::from(0xFFFF), FaultKind::Unknown);
    }

    #[test]
    fn test_fault_display() {
        let fault = CardServerFault::busy();
        let text = fault.to_string();
        assert!(text.starts_with("ServerBusy (0x0006)"), "{}", text);
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let fault: CardServerFault = ProtocolError::from(io).into();
        assert_eq!(fault.kind, FaultKind::Transport);

        let fault: CardServerFault = ProtocolError::InvalidMagic(*b"BNDP").into();
        assert_eq!(fault.kind, FaultKind::Protocol);
    }
}

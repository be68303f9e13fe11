//! Error types for netboot.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for netboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for netboot.
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("could not connect to NetDimm at {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("not connected to NetDimm")]
    NotConnected,

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Caller-side validation errors
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    // Message protocol errors
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    // Host errors
    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("cabinet {0} is already managed")]
    DuplicateCabinet(std::net::IpAddr),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("receive timed out after {0:?}")]
    ReceiveTimeout(std::time::Duration),

    #[error("socket error: {0}")]
    SocketError(String),
}

/// Wire protocol errors. These indicate a firmware/assumption mismatch and are never
/// retried by the link itself.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unexpected response to {request}: expected packet id {expected:#04x}, got {got:#04x}")]
    UnexpectedPacketId {
        request: &'static str,
        expected: u8,
        got: u8,
    },

    #[error("unexpected response length to {request}: expected {expected}, got {got}")]
    UnexpectedLength {
        request: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

/// Caller-programming-error class. Raised before any I/O where possible.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("cannot have misaligned address {addr:#010x} for {width} peek/poke")]
    MisalignedAddress { addr: u32, width: &'static str },

    #[error("invalid peek/poke size {0}, expected 1, 2 or 4")]
    InvalidWidth(u32),

    #[error("key must be 8 bytes in length, got {0}")]
    InvalidKeyLength(usize),

    #[error("packet of {size} bytes is too long to send (max {max})")]
    PacketTooLong { size: usize, max: usize },

    #[error("message of {size} bytes is too long to send (max {max})")]
    MessageTooLong { size: usize, max: usize },

    #[error("fragment of {0} bytes is shorter than the message header")]
    ShortFragment(usize),

    #[error("decompressed length {got} does not match advertised length {expected}")]
    DecompressedLength { expected: usize, got: usize },

    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Register mailbox message protocol errors.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("cannot read message config register")]
    ConfigUnavailable,

    #[error("target is not running the message protocol")]
    ProtocolNotRunning,

    #[error("cannot send message with sequence {0}")]
    SendFailed(u16),

    #[error("register exchange desynchronised: {0}")]
    Desync(String),
}

/// Host (background transfer owner) errors.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("host {0} has an active transfer already")]
    TransferActive(String),

    #[error("cannot reboot host {0} mid-transfer")]
    RebootDuringTransfer(String),

    #[error("transfer task for {0} exited before reporting progress")]
    TransferVanished(String),

    #[error("image preparation failed: {0}")]
    ImagePreparation(String),
}

impl Error {
    /// Check if error is recoverable (the whole operation may be retried).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout
                | Error::ConnectionFailed { .. }
                | Error::ConnectionClosed
                | Error::Transport(_)
                | Error::Io(_)
        )
    }

    /// Check if error indicates the connection should be torn down.
    pub fn should_reconnect(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout
                | Error::Transport(_)
                | Error::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::ConnectionTimeout.is_recoverable());
        assert!(Error::Transport(TransportError::ReceiveFailed("eof".into())).is_recoverable());
        assert!(!Error::Validation(ValidationError::InvalidWidth(3)).is_recoverable());
        assert!(!Error::Protocol(ProtocolError::MalformedPacket("short".into())).is_recoverable());
    }

    #[test]
    fn test_protocol_errors_drop_connection() {
        let err = Error::Protocol(ProtocolError::UnexpectedPacketId {
            request: "peek",
            expected: 0x10,
            got: 0x04,
        });
        assert!(err.should_reconnect());
        assert!(err.to_string().contains("0x10"));
    }
}

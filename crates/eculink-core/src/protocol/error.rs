//! Protocol errors

use thiserror::Error;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection is closed")]
    Closed,

    #[error("Not connected to ECU")]
    NotConnected,

    #[error("Command timeout")]
    Timeout,

    #[error("Image size mismatch: expected {expected}, got {actual}")]
    ImageSizeMismatch { expected: usize, actual: usize },

    #[error("Configuration size {0} does not fit 16-bit paging")]
    ProfileTooLarge(usize),

    #[error("Io worker is gone")]
    WorkerGone,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors detected while decoding a framed packet
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Truncated frame: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Declared payload length {0} exceeds protocol maximum")]
    TooLong(usize),

    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },
}

//! Binary protocol communication
//!
//! Implements the framed binary protocol spoken by rusEFI-style engine
//! control units: paged configuration access, output-channel snapshots,
//! console text and composite trigger logging. Every command and response
//! travels in the same envelope (big-endian length, payload, CRC32 of the
//! payload).

pub mod assembler;
pub mod commands;
mod engine;
mod error;
pub mod packet;
pub mod transport;

pub use assembler::PacketAssembler;
pub use commands::Command;
pub use engine::CommandEngine;
pub use error::{FrameError, ProtocolError};
pub use transport::{ByteChannel, SerialChannel, TcpChannel};

/// Maximum number of configuration bytes moved by a single read or write
pub const BLOCKING_FACTOR: usize = 400;

/// Maximum packet payload size
pub const MAX_PACKET_SIZE: usize = 32768;

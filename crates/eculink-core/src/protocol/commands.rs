//! Protocol commands
//!
//! Command byte values, response codes and request builders for the binary
//! protocol. Offsets and counts in paged requests travel little-endian on
//! the wire; they are produced by big-endian writes of [`swap16`]-ed values,
//! which is how the device firmware defines the format.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

/// Commands supported by the binary protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Read a slice of the configuration page ('R')
    ReadPage,

    /// Write a chunk of configuration bytes ('C')
    ChunkWrite,

    /// Commit pending configuration writes to flash ('B')
    Burn,

    /// Ask for the CRC32 of the device-held configuration ('k')
    CrcCheck,

    /// Read the output-channel snapshot ('O')
    OutputChannels,

    /// Execute a text console command ('E')
    ExecuteText,

    /// Pull pending console text ('G')
    GetText,

    /// Fetch the composite trigger event buffer ('8')
    GetCompositeBuffer,

    /// Toggle a device-side logger ('l')
    SetLoggerSwitch,
}

impl Command {
    /// Get the wire byte for this command
    pub fn code(&self) -> u8 {
        match self {
            Command::ReadPage => b'R',
            Command::ChunkWrite => b'C',
            Command::Burn => b'B',
            Command::CrcCheck => b'k',
            Command::OutputChannels => b'O',
            Command::ExecuteText => b'E',
            Command::GetText => b'G',
            Command::GetCompositeBuffer => b'8',
            Command::SetLoggerSwitch => b'l',
        }
    }

    /// Look a command up by its wire byte
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'R' => Some(Command::ReadPage),
            b'C' => Some(Command::ChunkWrite),
            b'B' => Some(Command::Burn),
            b'k' => Some(Command::CrcCheck),
            b'O' => Some(Command::OutputChannels),
            b'E' => Some(Command::ExecuteText),
            b'G' => Some(Command::GetText),
            b'8' => Some(Command::GetCompositeBuffer),
            b'l' => Some(Command::SetLoggerSwitch),
            _ => None,
        }
    }
}

/// Generic success response code
pub const RESPONSE_OK: u8 = 0x00;

/// Success response code for the burn command
pub const RESPONSE_BURN_OK: u8 = 0x04;

/// Success response code for text console commands
pub const RESPONSE_COMMAND_OK: u8 = 0x07;

/// Logger-switch argument enabling composite trigger logging
pub const COMPOSITE_ENABLE: u8 = 1;

/// Logger-switch argument disabling composite trigger logging
pub const COMPOSITE_DISABLE: u8 = 2;

/// Swap the bytes of a 16-bit value
pub fn swap16(value: u16) -> u16 {
    value.swap_bytes()
}

/// Build the 7-byte paged read request
pub fn read_page(offset: u16, count: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 7];
    packet[0] = Command::ReadPage.code();
    // Page identifier, always zero on this protocol generation
    BigEndian::write_u16(&mut packet[1..3], 0);
    BigEndian::write_u16(&mut packet[3..5], swap16(offset));
    BigEndian::write_u16(&mut packet[5..7], swap16(count));
    packet
}

/// Build a chunk-write request placing `chunk` at absolute `offset`
pub fn chunk_write(chunk: &[u8], offset: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 7 + chunk.len()];
    packet[0] = Command::ChunkWrite.code();
    BigEndian::write_u16(&mut packet[1..3], 0);
    BigEndian::write_u16(&mut packet[3..5], swap16(offset));
    BigEndian::write_u16(&mut packet[5..7], swap16(chunk.len() as u16));
    packet[7..].copy_from_slice(chunk);
    packet
}

/// Build the burn request
pub fn burn() -> Vec<u8> {
    vec![Command::Burn.code()]
}

/// Build the configuration CRC request
///
/// Zero-argument command padded to the 7-byte paged-request shape.
pub fn crc_check() -> Vec<u8> {
    let mut packet = vec![0u8; 7];
    packet[0] = Command::CrcCheck.code();
    packet
}

/// Build the 5-byte output-channel snapshot request
pub fn output_channels(count: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 5];
    packet[0] = Command::OutputChannels.code();
    // Offset, always zero: the whole snapshot is requested
    BigEndian::write_u16(&mut packet[1..3], 0);
    BigEndian::write_u16(&mut packet[3..5], swap16(count));
    packet
}

/// Build an execute-text request
pub fn execute_text(text: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + text.len());
    packet.push(Command::ExecuteText.code());
    packet.extend_from_slice(text.as_bytes());
    packet
}

/// Build the pending-text pull request
pub fn get_text() -> Vec<u8> {
    vec![Command::GetText.code()]
}

/// Build the composite buffer fetch request
pub fn get_composite_buffer() -> Vec<u8> {
    vec![Command::GetCompositeBuffer.code()]
}

/// Build a logger-switch request
pub fn set_logger_switch(mode: u8) -> Vec<u8> {
    vec![Command::SetLoggerSwitch.code(), mode]
}

/// Check that a response is present, non-empty and led by `code`
pub fn check_response_code(response: Option<&[u8]>, code: u8) -> bool {
    matches!(response, Some(r) if !r.is_empty() && r[0] == code)
}

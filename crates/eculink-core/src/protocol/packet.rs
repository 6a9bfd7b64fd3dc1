//! Packet encoding/decoding
//!
//! Implements the binary envelope shared by every command and response
//! (rusEFI/msEnvelope_1.0):
//! - 2 bytes: payload length (big-endian)
//! - N bytes: payload
//! - 4 bytes: CRC32 (of payload only, NOT length+payload)

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;

use super::{FrameError, MAX_PACKET_SIZE};

/// CRC32 of a packet payload (the envelope checksum covers the payload only)
pub fn payload_crc(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Wrap a payload in the length+CRC envelope
pub fn encode(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PACKET_SIZE);
    let mut frame = Vec::with_capacity(2 + payload.len() + 4);

    // Length (2 bytes, big-endian)
    let mut len_bytes = [0u8; 2];
    BigEndian::write_u16(&mut len_bytes, payload.len() as u16);
    frame.extend_from_slice(&len_bytes);

    // Payload
    frame.extend_from_slice(payload);

    // CRC (4 bytes, big-endian)
    let mut crc_bytes = [0u8; 4];
    BigEndian::write_u32(&mut crc_bytes, payload_crc(payload));
    frame.extend_from_slice(&crc_bytes);

    frame
}

/// Decode one framed packet, validating length bounds and the CRC
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    if frame.len() < 6 {
        return Err(FrameError::Truncated {
            expected: 6,
            actual: frame.len(),
        });
    }

    let length = BigEndian::read_u16(&frame[0..2]) as usize;
    if length > MAX_PACKET_SIZE {
        return Err(FrameError::TooLong(length));
    }
    if frame.len() < 2 + length + 4 {
        return Err(FrameError::Truncated {
            expected: 2 + length + 4,
            actual: frame.len(),
        });
    }

    let payload = frame[2..2 + length].to_vec();
    let received_crc = BigEndian::read_u32(&frame[2 + length..2 + length + 4]);
    let expected_crc = payload_crc(&payload);

    if received_crc != expected_crc {
        return Err(FrameError::CrcMismatch {
            expected: expected_crc,
            actual: received_crc,
        });
    }

    Ok(payload)
}

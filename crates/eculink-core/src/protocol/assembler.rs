//! Incoming packet assembler
//!
//! Transport bytes arrive on the reader thread and are consumed here as
//! whole CRC-checked packets. Readers block until a complete frame is
//! buffered, the deadline passes, or the stream dies. A malformed frame
//! (bad length, checksum failure) is reported as an absent packet so the
//! caller can retry the exchange; a dead stream is final.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace, warn};

use super::{packet, ProtocolError, MAX_PACKET_SIZE};

/// Upper bound on buffered raw bytes; beyond this the input is assumed to
/// be garbage and discarded wholesale
const BUFFER_CAP: usize = 64 * 1024;

/// Slack allowed on top of the largest expected short response
const SHORT_RESPONSE_SLACK: usize = 10;

struct AssemblerState {
    buffer: VecDeque<u8>,
    dead: bool,
}

enum Extract {
    NeedMore,
    Garbage(&'static str),
    Packet(Vec<u8>),
}

/// Thread-safe byte sink and blocking packet source
pub struct PacketAssembler {
    state: Mutex<AssemblerState>,
    data_ready: Condvar,
    short_limit: usize,
}

impl PacketAssembler {
    /// Create an assembler; `expected_short` is the largest payload a
    /// non-`allow_long` exchange can legitimately produce
    pub fn new(expected_short: usize) -> Self {
        Self {
            state: Mutex::new(AssemblerState {
                buffer: VecDeque::new(),
                dead: false,
            }),
            data_ready: Condvar::new(),
            short_limit: expected_short + SHORT_RESPONSE_SLACK,
        }
    }

    /// Append raw transport bytes (reader thread)
    pub fn push(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.dead {
            return;
        }
        state.buffer.extend(bytes);
        if state.buffer.len() > BUFFER_CAP {
            warn!(
                buffered = state.buffer.len(),
                "Input buffer overflow, discarding everything"
            );
            state.buffer.clear();
        }
        drop(state);
        self.data_ready.notify_all();
    }

    /// Discard any stale buffered input, partial frames included
    pub fn drop_pending(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.buffer.is_empty() {
            debug!(bytes = state.buffer.len(), "Dropping stale input");
            state.buffer.clear();
        }
    }

    /// Mark the stream dead and wake every waiter
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.dead = true;
        drop(state);
        self.data_ready.notify_all();
    }

    /// Block until a CRC-valid packet is available and return its payload.
    ///
    /// Returns `Ok(None)` when the deadline passes or the next frame is
    /// malformed (both retryable), `Err(Closed)` once the stream is dead
    /// and no complete frame remains buffered.
    pub fn next_packet(
        &self,
        deadline: Instant,
        allow_long: bool,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match self.try_extract(&mut state.buffer, allow_long) {
                Extract::Packet(payload) => {
                    trace!(len = payload.len(), "Received packet");
                    return Ok(Some(payload));
                }
                Extract::Garbage(reason) => {
                    warn!(reason, "Discarding malformed frame");
                    return Ok(None);
                }
                Extract::NeedMore => {}
            }

            if state.dead {
                return Err(ProtocolError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!("Timed out waiting for packet");
                return Ok(None);
            }
            let (next, _) = self
                .data_ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
    }

    fn try_extract(&self, buffer: &mut VecDeque<u8>, allow_long: bool) -> Extract {
        if buffer.len() < 2 {
            return Extract::NeedMore;
        }
        let length = ((buffer[0] as usize) << 8) | buffer[1] as usize;

        if length > MAX_PACKET_SIZE {
            buffer.drain(..2);
            return Extract::Garbage("declared length exceeds maximum");
        }
        if !allow_long && length > self.short_limit {
            buffer.drain(..2);
            return Extract::Garbage("implausibly long for a short exchange");
        }
        if buffer.len() < 2 + length + 4 {
            return Extract::NeedMore;
        }

        buffer.drain(..2);
        let payload: Vec<u8> = buffer.drain(..length).collect();
        let crc_bytes: Vec<u8> = buffer.drain(..4).collect();
        let received_crc = BigEndian::read_u32(&crc_bytes);

        if received_crc != packet::payload_crc(&payload) {
            return Extract::Garbage("checksum failure");
        }
        Extract::Packet(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(200)
    }

    #[test]
    fn test_reassembles_split_frame() {
        let assembler = PacketAssembler::new(400);
        let frame = packet::encode(&[0x00, 0xAA, 0xBB]);

        assembler.push(&frame[..3]);
        assembler.push(&frame[3..]);

        let payload = assembler.next_packet(soon(), false).unwrap();
        assert_eq!(payload, Some(vec![0x00, 0xAA, 0xBB]));
    }

    #[test]
    fn test_deadline_expiry_is_retryable() {
        let assembler = PacketAssembler::new(400);
        let deadline = Instant::now() + Duration::from_millis(10);

        let result = assembler.next_packet(deadline, false);
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_recovers_from_garbage_after_drop_pending() {
        let assembler = PacketAssembler::new(400);

        assembler.push(&[0xFF, 0xFF, 0x01, 0x02]);
        assert!(matches!(assembler.next_packet(soon(), false), Ok(None)));

        assembler.drop_pending();
        assembler.push(&packet::encode(&[0x07]));
        let payload = assembler.next_packet(soon(), false).unwrap();
        assert_eq!(payload, Some(vec![0x07]));
    }

    #[test]
    fn test_checksum_failure_is_retryable() {
        let assembler = PacketAssembler::new(400);
        let mut frame = packet::encode(&[1, 2, 3]);
        frame[4] ^= 0xFF;

        assembler.push(&frame);
        assert!(matches!(assembler.next_packet(soon(), false), Ok(None)));
    }

    #[test]
    fn test_short_limit_depends_on_allow_long() {
        let payload = vec![0u8; 64];

        let strict = PacketAssembler::new(8);
        strict.push(&packet::encode(&payload));
        assert!(matches!(strict.next_packet(soon(), false), Ok(None)));

        let relaxed = PacketAssembler::new(8);
        relaxed.push(&packet::encode(&payload));
        let received = relaxed.next_packet(soon(), true).unwrap();
        assert_eq!(received, Some(payload));
    }

    #[test]
    fn test_shutdown_unblocks_waiter() {
        let assembler = Arc::new(PacketAssembler::new(400));
        let waiter = {
            let assembler = assembler.clone();
            thread::spawn(move || {
                assembler.next_packet(Instant::now() + Duration::from_secs(30), false)
            })
        };

        thread::sleep(Duration::from_millis(20));
        assembler.shutdown();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(ProtocolError::Closed)));
    }

    #[test]
    fn test_buffered_frame_survives_shutdown() {
        let assembler = PacketAssembler::new(400);
        assembler.push(&packet::encode(&[0x04]));
        assembler.shutdown();

        let payload = assembler.next_packet(soon(), false).unwrap();
        assert_eq!(payload, Some(vec![0x04]));
    }
}

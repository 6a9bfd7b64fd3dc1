//! Composite trigger logging
//!
//! While logging is switched on, the device accumulates a high-resolution
//! record of trigger inputs and actuator outputs. The host fetches that
//! buffer periodically and fans the parsed events out to a set of log
//! sinks. On the wire each event is 5 bytes: a big-endian timestamp in
//! device clock ticks followed by one flags byte.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

pub mod logger;
pub mod sink;

pub use logger::{CompositeGate, CompositeLogger, COMPOSITE_OFF_RPM, HIGH_RPM_DELAY};
pub use sink::{log_file_name, EventSink, NullSinkFactory, SinkFactory};

/// Size of one on-wire composite record
pub const EVENT_SIZE: usize = 5;

/// One sampled state of the trigger inputs and actuator outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeEvent {
    /// Device-side timestamp in device clock ticks
    pub timestamp: u32,
    /// Primary trigger input level
    pub primary_trigger: bool,
    /// Secondary trigger input level
    pub secondary_trigger: bool,
    /// Decoded trigger state
    pub trigger: bool,
    /// Synchronization state
    pub sync: bool,
    /// Coil output level
    pub coil: bool,
    /// Injector output level
    pub injector: bool,
}

/// Parse events from a fetch response payload.
///
/// The leading response code byte is skipped; a trailing remainder shorter
/// than one record is ignored.
pub fn parse_events(payload: &[u8]) -> Vec<CompositeEvent> {
    let body = payload.get(1..).unwrap_or(&[]);
    body.chunks_exact(EVENT_SIZE)
        .map(|record| {
            let flags = record[4];
            CompositeEvent {
                timestamp: BigEndian::read_u32(&record[0..4]),
                primary_trigger: flags & 1 != 0,
                secondary_trigger: flags & 2 != 0,
                trigger: flags & 4 != 0,
                sync: flags & 8 != 0,
                coil: flags & 16 != 0,
                injector: flags & 32 != 0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_events() {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&[0x00, 0x00, 0x12, 0x34, 0b0000_0101]);
        payload.extend_from_slice(&[0x00, 0x00, 0x12, 0x99, 0b0010_1000]);

        let events = parse_events(&payload);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp, 0x1234);
        assert!(events[0].primary_trigger);
        assert!(!events[0].secondary_trigger);
        assert!(events[0].trigger);
        assert!(!events[0].sync);

        assert_eq!(events[1].timestamp, 0x1299);
        assert!(events[1].sync);
        assert!(events[1].injector);
        assert!(!events[1].coil);
    }

    #[test]
    fn test_trailing_remainder_is_ignored() {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&[0, 0, 0, 1, 0b0001_0000]);
        payload.extend_from_slice(&[9, 9, 9]);

        let events = parse_events(&payload);

        assert_eq!(events.len(), 1);
        assert!(events[0].coil);
    }

    #[test]
    fn test_empty_payload() {
        assert!(parse_events(&[]).is_empty());
        assert!(parse_events(&[0x00]).is_empty());
    }
}

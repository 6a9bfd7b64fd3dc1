//! Live telemetry
//!
//! The device serves an output-channel snapshot on request: a flat byte
//! block in which every channel occupies a slot at a declared offset. A
//! slot is always read as a 4-byte little-endian quantity and then reduced
//! per the channel kind; narrower kinds use the low bytes. The reduced
//! value is scaled before publication.

use serde::{Deserialize, Serialize};

pub(crate) mod poller;
pub mod registry;

pub use registry::{ListenerId, SensorRegistry};

/// Registry name of the engine-speed channel
pub const RPM_CHANNEL: &str = "rpm";

/// On-wire representation of an output channel slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Unsigned 8-bit
    U08,
    /// Signed 8-bit
    S08,
    /// Unsigned 16-bit
    U16,
    /// Signed 16-bit
    S16,
    /// Signed 32-bit
    S32,
    /// 32-bit float
    F32,
}

/// One live data channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    /// Channel name, used as the registry key
    pub name: String,
    /// Wire representation; `None` marks a derived channel that is never
    /// decoded from the snapshot
    pub kind: Option<ChannelKind>,
    /// Byte offset of the slot inside the snapshot
    pub offset: usize,
    /// Multiplier applied to the raw value
    pub scale: f64,
}

impl Sensor {
    /// Define a decodable channel
    pub fn new(name: impl Into<String>, kind: ChannelKind, offset: usize, scale: f64) -> Self {
        Self {
            name: name.into(),
            kind: Some(kind),
            offset,
            scale,
        }
    }

    /// Define a derived channel that other components compute and publish
    pub fn derived(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            offset: 0,
            scale: 1.0,
        }
    }
}

/// Reduce one 4-byte little-endian slot per the channel kind
pub fn decode_slot(kind: ChannelKind, slot: [u8; 4]) -> f64 {
    let raw = i32::from_le_bytes(slot);
    match kind {
        ChannelKind::F32 => f32::from_le_bytes(slot) as f64,
        ChannelKind::S32 => raw as f64,
        ChannelKind::U16 => (raw & 0xFFFF) as f64,
        ChannelKind::S16 => ((raw & 0xFFFF) as u16 as i16) as f64,
        ChannelKind::U08 => (raw & 0xFF) as f64,
        ChannelKind::S08 => ((raw & 0xFF) as u8 as i8) as f64,
    }
}

/// Decode every decodable channel against a snapshot body (without the
/// leading response code byte), yielding scaled `(name, value)` pairs.
/// Derived channels and slots outside the snapshot are skipped.
pub fn decode_snapshot<'a>(
    sensors: &'a [Sensor],
    snapshot: &'a [u8],
) -> impl Iterator<Item = (&'a str, f64)> {
    sensors.iter().filter_map(move |sensor| {
        let kind = sensor.kind?;
        let slot = snapshot.get(sensor.offset..sensor.offset + 4)?;
        let value = decode_slot(kind, [slot[0], slot[1], slot[2], slot[3]]) * sensor.scale;
        Some((sensor.name.as_str(), value))
    })
}

/// Default channel table for the standard snapshot layout
pub fn standard_sensors() -> Vec<Sensor> {
    vec![
        Sensor::new(RPM_CHANNEL, ChannelKind::S32, 0, 1.0),
        Sensor::new("seconds", ChannelKind::S32, 4, 1.0),
        Sensor::new("coolant_temp", ChannelKind::S16, 8, 0.01),
        Sensor::new("intake_air_temp", ChannelKind::S16, 12, 0.01),
        Sensor::new("throttle_position", ChannelKind::F32, 16, 1.0),
        Sensor::new("map", ChannelKind::F32, 20, 1.0),
        Sensor::new("afr", ChannelKind::F32, 24, 1.0),
        Sensor::new("battery_voltage", ChannelKind::F32, 28, 1.0),
        Sensor::new("oil_pressure", ChannelKind::F32, 32, 1.0),
        Sensor::new("vehicle_speed", ChannelKind::U08, 36, 1.0),
        Sensor::new("warning_counter", ChannelKind::U16, 40, 1.0),
        Sensor::derived("engine_load"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_reduction_boundary_values() {
        let slot = [0xFF, 0xFF, 0x00, 0x00];

        assert_eq!(decode_slot(ChannelKind::U16, slot), 65535.0);
        assert_eq!(decode_slot(ChannelKind::S16, slot), -1.0);
        assert_eq!(decode_slot(ChannelKind::U08, slot), 255.0);
        assert_eq!(decode_slot(ChannelKind::S08, slot), -1.0);
    }

    #[test]
    fn test_float_slot() {
        let slot = 1.5f32.to_le_bytes();
        assert_eq!(decode_slot(ChannelKind::F32, slot), 1.5);
    }

    #[test]
    fn test_signed_32bit_slot() {
        let slot = (-1234i32).to_le_bytes();
        assert_eq!(decode_slot(ChannelKind::S32, slot), -1234.0);
    }

    #[test]
    fn test_snapshot_decode_applies_scale() {
        let sensors = vec![Sensor::new("coolant", ChannelKind::S16, 0, 0.01)];
        let mut snapshot = vec![0u8; 8];
        snapshot[..4].copy_from_slice(&8750i32.to_le_bytes());

        let decoded: Vec<_> = decode_snapshot(&sensors, &snapshot).collect();
        assert_eq!(decoded, vec![("coolant", 87.5)]);
    }

    #[test]
    fn test_snapshot_decode_skips_derived_and_out_of_range() {
        let sensors = vec![
            Sensor::new("rpm", ChannelKind::S32, 0, 1.0),
            Sensor::derived("engine_load"),
            Sensor::new("beyond", ChannelKind::U08, 100, 1.0),
        ];
        let mut snapshot = vec![0u8; 8];
        snapshot[..4].copy_from_slice(&800i32.to_le_bytes());

        let decoded: Vec<_> = decode_snapshot(&sensors, &snapshot).collect();
        assert_eq!(decoded, vec![("rpm", 800.0)]);
    }
}

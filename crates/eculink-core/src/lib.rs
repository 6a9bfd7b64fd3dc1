//! # ECULink Core Library
//!
//! Client-side binary wire protocol for talking to an engine-control
//! device over a byte-stream transport.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Packet framing with CRC32 checksums and an incoming packet assembler
//! - A serialized command engine over serial, TCP or in-memory transports
//! - Configuration image synchronization: cached/full read, differential
//!   write and transactional burn
//! - Live telemetry polling with typed sensor decoding and a listener
//!   registry
//! - Composite trigger-event capture with RPM-based hysteresis
//! - An in-memory device simulator for tests, examples and demos
//!
//! ## Example
//!
//! ```rust,ignore
//! use eculink_core::connection::{ConnectionBuilder, DeviceProfile};
//! use eculink_core::protocol::SerialChannel;
//!
//! let port = serialport::new("/dev/ttyUSB0", 115200).open()?;
//! let connection = ConnectionBuilder::new(
//!     Box::new(SerialChannel::new(port)),
//!     DeviceProfile::standard(),
//! )
//! .build()?;
//!
//! if connection.connect() {
//!     println!("RPM: {:?}", connection.sensors().latest("rpm"));
//! }
//! ```

pub mod composite;
pub mod connection;
pub mod image;
pub mod protocol;
pub mod sim;
pub mod telemetry;

pub(crate) mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::composite::{CompositeEvent, EventSink, SinkFactory};
    pub use crate::connection::{
        ConnectionBuilder, ConnectionConfig, ConnectionState, DeviceProfile, EcuConnection,
    };
    pub use crate::image::{ConfigurationImage, FileImageStore, ImageStore};
    pub use crate::protocol::{ByteChannel, ProtocolError, SerialChannel, TcpChannel};
    pub use crate::sim::{memory_duplex, MemoryChannel, SimEcu};
    pub use crate::telemetry::{ChannelKind, Sensor, SensorRegistry};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

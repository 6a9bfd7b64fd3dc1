//! Composite event sinks
//!
//! Where parsed events end up is the embedder's concern: the logger drives
//! whatever set of sinks a factory opens together (the usual tooling pairs
//! a human-readable log with VCD and Logicdata waveform captures). Sinks
//! open lazily when the first fetch succeeds and close exactly once when
//! logging turns off or the connection closes.

use std::io;

use chrono::Local;

use super::CompositeEvent;

/// Receives batches of parsed composite events
pub trait EventSink: Send {
    /// Append a batch of events
    fn append(&mut self, events: &[CompositeEvent]) -> io::Result<()>;

    /// Flush and close the sink
    fn close(&mut self) -> io::Result<()>;
}

/// Opens the sink set for one logging session
pub trait SinkFactory: Send + Sync {
    /// Open every sink the next session's events should fan out to
    fn open_sinks(&self) -> Vec<Box<dyn EventSink>>;
}

/// Factory producing no sinks; fetched events are dropped
pub struct NullSinkFactory;

impl SinkFactory for NullSinkFactory {
    fn open_sinks(&self) -> Vec<Box<dyn EventSink>> {
        Vec::new()
    }
}

/// Timestamped log file name, e.g. `composite_2026-08-23_14_02_11_123.csv`
pub fn log_file_name(prefix: &str, extension: &str) -> String {
    format!(
        "{}{}.{}",
        prefix,
        Local::now().format("%Y-%m-%d_%H_%M_%S_%3f"),
        extension
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name_shape() {
        let name = log_file_name("composite_", "csv");

        assert!(name.starts_with("composite_2"));
        assert!(name.ends_with(".csv"));
        // prefix + "YYYY-MM-DD_HH_MM_SS_mmm" + ".csv"
        assert_eq!(name.len(), "composite_".len() + 23 + 4);
    }
}

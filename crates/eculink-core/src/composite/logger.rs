//! Composite logging decisions and fan-out
//!
//! Composite capture is wanted while the engine is stopped or turning
//! slowly; at speed the stream is too chatty to be useful. An RPM listener
//! feeds the gate, and every poll tick acts on its decision: fetch the
//! device buffer while capture is desired, or switch device-side logging
//! off (exactly once) after the engine has run fast long enough.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::protocol::commands::{self, COMPOSITE_DISABLE, RESPONSE_OK};
use crate::protocol::CommandEngine;

use super::parse_events;
use super::sink::{EventSink, SinkFactory};

/// RPM at or below which composite logging is desired
pub const COMPOSITE_OFF_RPM: f64 = 300.0;

/// Default time the engine must run fast before capture is given up
pub const HIGH_RPM_DELAY: Duration = Duration::from_secs(10);

/// Hysteresis on the capture decision: low RPM re-arms it immediately,
/// high RPM disarms it only after running continuously for the whole delay
pub struct CompositeGate {
    off_rpm: f64,
    high_rpm_delay: Duration,
    desired: bool,
    last_low_rpm: Instant,
}

impl CompositeGate {
    /// Create a gate; capture starts desired
    pub fn new(off_rpm: f64, high_rpm_delay: Duration) -> Self {
        Self {
            off_rpm,
            high_rpm_delay,
            desired: true,
            last_low_rpm: Instant::now(),
        }
    }

    /// Feed an RPM sample observed at `now`
    pub fn on_rpm(&mut self, rpm: f64, now: Instant) {
        if rpm <= self.off_rpm {
            self.last_low_rpm = now;
            self.desired = true;
        } else if self.desired && now.duration_since(self.last_low_rpm) > self.high_rpm_delay {
            info!("Engine running at speed, turning composite logging off");
            self.desired = false;
        }
    }

    /// Whether capture is currently wanted
    pub fn desired(&self) -> bool {
        self.desired
    }
}

struct SinkSet {
    opened: bool,
    sinks: Vec<Box<dyn EventSink>>,
}

/// Drives device-side composite logging per the gate's decision
pub struct CompositeLogger {
    gate: Arc<Mutex<CompositeGate>>,
    factory: Box<dyn SinkFactory>,
    sinks: Mutex<SinkSet>,
    /// Set once a fetch has switched device-side logging on
    enabled: AtomicBool,
}

impl CompositeLogger {
    /// Create a logger fanning out to sinks opened by `factory`
    pub fn new(factory: Box<dyn SinkFactory>, off_rpm: f64, high_rpm_delay: Duration) -> Self {
        Self {
            gate: Arc::new(Mutex::new(CompositeGate::new(off_rpm, high_rpm_delay))),
            factory,
            sinks: Mutex::new(SinkSet {
                opened: false,
                sinks: Vec::new(),
            }),
            enabled: AtomicBool::new(false),
        }
    }

    /// Shared gate handle for wiring the RPM listener
    pub(crate) fn gate(&self) -> Arc<Mutex<CompositeGate>> {
        self.gate.clone()
    }

    /// Act on the gate's decision; runs once per poll tick on the worker
    pub(crate) fn poll_tick(&self, engine: &CommandEngine) {
        let desired = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .desired();
        if desired {
            self.fetch(engine);
        } else if self.enabled.load(Ordering::SeqCst) {
            self.disable(engine);
        }
    }

    fn fetch(&self, engine: &CommandEngine) {
        if engine.is_closed() {
            return;
        }
        // The fetch request itself switches device-side logging on
        self.enabled.store(true, Ordering::SeqCst);
        let response =
            engine.execute_command(&commands::get_composite_buffer(), "composite log", true);
        match response {
            Some(r) if !r.is_empty() && r[0] == RESPONSE_OK => {
                self.append(&parse_events(&r));
            }
            _ => {}
        }
    }

    fn append(&self, events: &[super::CompositeEvent]) {
        let mut set = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.opened {
            set.sinks = self.factory.open_sinks();
            set.opened = true;
        }
        for sink in set.sinks.iter_mut() {
            if let Err(e) = sink.append(events) {
                warn!("Composite sink write failed: {}", e);
            }
        }
    }

    fn disable(&self, engine: &CommandEngine) {
        // The reply content does not matter; a transport failure closes
        // the connection through the engine anyway
        engine.execute_command(
            &commands::set_logger_switch(COMPOSITE_DISABLE),
            "disable composite",
            false,
        );
        self.enabled.store(false, Ordering::SeqCst);
        self.close_sinks();
    }

    /// Close and drop all open sinks; the next session reopens fresh ones
    pub(crate) fn close_sinks(&self) {
        let mut set = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        for sink in set.sinks.iter_mut() {
            if let Err(e) = sink.close() {
                warn!("Composite sink close failed: {}", e);
            }
        }
        set.sinks.clear();
        set.opened = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::CompositeEvent;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_gate_starts_desired() {
        let gate = CompositeGate::new(COMPOSITE_OFF_RPM, HIGH_RPM_DELAY);
        assert!(gate.desired());
    }

    #[test]
    fn test_gate_stays_desired_at_zero_rpm() {
        let mut gate = CompositeGate::new(300.0, Duration::from_secs(10));
        let t0 = Instant::now();

        gate.on_rpm(0.0, t0);
        gate.on_rpm(0.0, t0 + Duration::from_secs(100));

        assert!(gate.desired());
    }

    #[test]
    fn test_gate_holds_through_short_bursts() {
        let mut gate = CompositeGate::new(300.0, Duration::from_secs(10));
        let t0 = Instant::now();

        gate.on_rpm(100.0, t0);
        gate.on_rpm(900.0, t0 + Duration::from_secs(5));

        assert!(gate.desired());
    }

    #[test]
    fn test_gate_turns_off_after_sustained_speed() {
        let mut gate = CompositeGate::new(300.0, Duration::from_secs(10));
        let t0 = Instant::now();

        gate.on_rpm(100.0, t0);
        gate.on_rpm(900.0, t0 + Duration::from_secs(11));

        assert!(!gate.desired());
    }

    #[test]
    fn test_gate_rearms_on_low_rpm() {
        let mut gate = CompositeGate::new(300.0, Duration::from_secs(10));
        let t0 = Instant::now();

        gate.on_rpm(100.0, t0);
        gate.on_rpm(900.0, t0 + Duration::from_secs(11));
        assert!(!gate.desired());

        gate.on_rpm(200.0, t0 + Duration::from_secs(12));
        assert!(gate.desired());
    }

    struct RecordingSink {
        batches: Arc<AtomicU32>,
        closes: Arc<AtomicU32>,
    }

    impl EventSink for RecordingSink {
        fn append(&mut self, _events: &[CompositeEvent]) -> std::io::Result<()> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) -> std::io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RecordingFactory {
        opens: Arc<AtomicU32>,
        batches: Arc<AtomicU32>,
        closes: Arc<AtomicU32>,
    }

    impl SinkFactory for RecordingFactory {
        fn open_sinks(&self) -> Vec<Box<dyn EventSink>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            vec![Box::new(RecordingSink {
                batches: self.batches.clone(),
                closes: self.closes.clone(),
            })]
        }
    }

    #[test]
    fn test_sinks_open_lazily_and_close_once() {
        let opens = Arc::new(AtomicU32::new(0));
        let batches = Arc::new(AtomicU32::new(0));
        let closes = Arc::new(AtomicU32::new(0));
        let logger = CompositeLogger::new(
            Box::new(RecordingFactory {
                opens: opens.clone(),
                batches: batches.clone(),
                closes: closes.clone(),
            }),
            300.0,
            Duration::from_secs(10),
        );

        logger.append(&[]);
        logger.append(&[]);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(batches.load(Ordering::SeqCst), 2);

        logger.close_sinks();
        logger.close_sinks();
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // A new session opens a fresh sink set
        logger.append(&[]);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }
}

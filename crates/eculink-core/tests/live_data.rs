//! Telemetry polling, console traffic and composite capture end-to-end
//! against the simulated device.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use eculink_core::composite::{CompositeEvent, EventSink, SinkFactory};
use eculink_core::connection::{
    ConnectionBuilder, ConnectionConfig, ConnectionState, DeviceProfile,
};
use eculink_core::protocol::Command;
use eculink_core::sim::SimEcu;
use eculink_core::telemetry::{ChannelKind, Sensor, SensorRegistry};

const CONFIG_SIZE: usize = 400;
const OUTPUTS_SIZE: usize = 64;

fn test_profile() -> DeviceProfile {
    DeviceProfile {
        total_config_size: CONFIG_SIZE,
        outputs_size: OUTPUTS_SIZE,
        sensors: vec![
            Sensor::new("rpm", ChannelKind::S32, 0, 1.0),
            Sensor::new("coolant_temp", ChannelKind::S16, 8, 0.01),
            Sensor::new("battery_voltage", ChannelKind::F32, 12, 1.0),
        ],
    }
}

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        io_timeout: Duration::from_millis(500),
        read_image_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(2),
        poll_period: Duration::from_millis(20),
        composite_off_rpm: 300.0,
        high_rpm_delay: Duration::from_millis(200),
    }
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn test_poller_publishes_scaled_sensor_values() {
    let (sim, link) = SimEcu::start(CONFIG_SIZE, OUTPUTS_SIZE).unwrap();
    sim.set_rpm(850);
    sim.write_outputs(8, &(-1234i16).to_le_bytes());
    sim.write_outputs(12, &13.8f32.to_le_bytes());

    let registry = Arc::new(SensorRegistry::new());
    let connection = ConnectionBuilder::new(Box::new(link), test_profile())
        .config(fast_config())
        .sensors(registry.clone())
        .build()
        .unwrap();
    assert!(connection.connect());

    wait_for("first snapshot", || registry.latest("rpm").is_some());

    assert_eq!(registry.latest("rpm"), Some(850.0));
    let coolant = registry.latest("coolant_temp").unwrap();
    assert!((coolant - (-12.34)).abs() < 1e-9, "coolant {}", coolant);
    let battery = registry.latest("battery_voltage").unwrap();
    assert!((battery - f64::from(13.8f32)).abs() < 1e-6, "battery {}", battery);
    assert_eq!(connection.latest_outputs().unwrap().len(), OUTPUTS_SIZE);
}

#[test]
fn test_state_changes_are_observed() {
    let (_sim, link) = SimEcu::start(CONFIG_SIZE, OUTPUTS_SIZE).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let connection = {
        let seen = seen.clone();
        ConnectionBuilder::new(Box::new(link), test_profile())
            .config(fast_config())
            .on_state_change(move |state| seen.lock().unwrap().push(state))
            .build()
            .unwrap()
    };

    assert!(connection.connect());
    connection.close();

    let states = seen.lock().unwrap().clone();
    assert_eq!(
        states,
        vec![ConnectionState::Connected, ConnectionState::Closed]
    );
}

#[test]
fn test_data_arrived_fires_on_every_snapshot() {
    let (_sim, link) = SimEcu::start(CONFIG_SIZE, OUTPUTS_SIZE).unwrap();
    let arrivals = Arc::new(AtomicUsize::new(0));
    let connection = {
        let arrivals = arrivals.clone();
        ConnectionBuilder::new(Box::new(link), test_profile())
            .config(fast_config())
            .on_data_arrived(move || {
                arrivals.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap()
    };
    assert!(connection.connect());

    // Image chunks already fired it once; polling keeps it climbing
    let after_connect = arrivals.load(Ordering::SeqCst);
    assert!(after_connect >= 1);
    wait_for("snapshot arrivals", || {
        arrivals.load(Ordering::SeqCst) >= after_connect + 3
    });
}

#[test]
fn test_console_text_is_forwarded_with_crlf() {
    let (sim, link) = SimEcu::start(CONFIG_SIZE, OUTPUTS_SIZE).unwrap();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let connection = {
        let lines = lines.clone();
        ConnectionBuilder::new(Box::new(link), test_profile())
            .config(fast_config())
            .on_console_text(move |text| lines.lock().unwrap().push(text.to_string()))
            .build()
            .unwrap()
    };
    assert!(connection.connect());

    sim.push_console_line("knock detected on cylinder 3");

    // Quiet pulls emit bare terminators around the real line
    wait_for("console line", || {
        lines.lock().unwrap().iter().any(|line| line != "\r\n")
    });
    let seen = lines.lock().unwrap().clone();
    assert!(seen.contains(&"knock detected on cylinder 3\r\n".to_string()));
}

#[test]
fn test_quiet_console_still_emits_the_terminator() {
    let (_sim, link) = SimEcu::start(CONFIG_SIZE, OUTPUTS_SIZE).unwrap();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let connection = {
        let lines = lines.clone();
        ConnectionBuilder::new(Box::new(link), test_profile())
            .config(fast_config())
            .on_console_text(move |text| lines.lock().unwrap().push(text.to_string()))
            .build()
            .unwrap()
    };
    assert!(connection.connect());

    // Nothing is queued on the device; every pull pauses and then still
    // hands the console its line ending
    wait_for("terminator", || !lines.lock().unwrap().is_empty());
    assert!(lines.lock().unwrap().iter().all(|line| line == "\r\n"));
}

#[test]
fn test_text_commands_reach_the_device() {
    let (sim, link) = SimEcu::start(CONFIG_SIZE, OUTPUTS_SIZE).unwrap();
    let confirmed = Arc::new(Mutex::new(Vec::new()));
    let connection = {
        let confirmed = confirmed.clone();
        ConnectionBuilder::new(Box::new(link), test_profile())
            .config(fast_config())
            .on_confirmation(move |text| confirmed.lock().unwrap().push(text.to_string()))
            .build()
            .unwrap()
    };
    assert!(connection.connect());

    assert!(!connection.send_text_command("set idle 850"));
    connection.send_command("fsio list");

    wait_for("commands on device", || sim.text_commands().len() == 2);
    assert_eq!(sim.text_commands(), vec!["set idle 850", "fsio list"]);
    assert_eq!(confirmed.lock().unwrap().clone(), vec!["fsio list"]);
}

struct RecordingSink {
    events: Arc<Mutex<Vec<CompositeEvent>>>,
    closes: Arc<AtomicUsize>,
}

impl EventSink for RecordingSink {
    fn append(&mut self, events: &[CompositeEvent]) -> io::Result<()> {
        self.events.lock().unwrap().extend_from_slice(events);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingFactory {
    events: Arc<Mutex<Vec<CompositeEvent>>>,
    closes: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
}

impl SinkFactory for RecordingFactory {
    fn open_sinks(&self) -> Vec<Box<dyn EventSink>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        vec![Box::new(RecordingSink {
            events: self.events.clone(),
            closes: self.closes.clone(),
        })]
    }
}

fn sample_event(timestamp: u32) -> CompositeEvent {
    CompositeEvent {
        timestamp,
        primary_trigger: true,
        secondary_trigger: false,
        trigger: true,
        sync: timestamp % 2 == 0,
        coil: false,
        injector: true,
    }
}

#[test]
fn test_composite_events_reach_the_sinks() {
    let (sim, link) = SimEcu::start(CONFIG_SIZE, OUTPUTS_SIZE).unwrap();
    let factory = RecordingFactory::default();
    let events = factory.events.clone();

    let connection = ConnectionBuilder::new(Box::new(link), test_profile())
        .config(fast_config())
        .sink_factory(Box::new(factory))
        .build()
        .unwrap();
    assert!(connection.connect());

    // Engine stopped: capture is desired, fetches flow
    sim.set_rpm(0);
    sim.queue_composite_events(&[sample_event(100), sample_event(350)]);

    wait_for("captured events", || events.lock().unwrap().len() >= 2);
    assert!(sim.composite_enabled());
    let captured = events.lock().unwrap().clone();
    assert_eq!(captured[0], sample_event(100));
    assert_eq!(captured[1], sample_event(350));
}

#[test]
fn test_composite_fetches_survive_outputs_failures() {
    let (sim, link) = SimEcu::start(CONFIG_SIZE, OUTPUTS_SIZE).unwrap();
    let connection = ConnectionBuilder::new(Box::new(link), test_profile())
        .config(fast_config())
        .build()
        .unwrap();
    assert!(connection.connect());

    // Stall every snapshot; the drive loop must keep fetching regardless,
    // since the fetches are what hold device-side capture open
    sim.swallow_next_responses(Command::OutputChannels, 1000);
    let before = sim.request_count(Command::GetCompositeBuffer);

    wait_for("composite fetches", || {
        sim.request_count(Command::GetCompositeBuffer) >= before + 2
    });
    assert!(sim.composite_enabled());
}

#[test]
fn test_sustained_rpm_disables_capture_once() {
    let (sim, link) = SimEcu::start(CONFIG_SIZE, OUTPUTS_SIZE).unwrap();
    let factory = RecordingFactory::default();
    let closes = factory.closes.clone();
    let opens = factory.opens.clone();

    let connection = ConnectionBuilder::new(Box::new(link), test_profile())
        .config(fast_config())
        .sink_factory(Box::new(factory))
        .build()
        .unwrap();
    assert!(connection.connect());

    // Capture is on while the engine is stopped; give it one batch so the
    // sinks actually open
    sim.queue_composite_events(&[sample_event(1)]);
    wait_for("sinks opened", || opens.load(Ordering::SeqCst) == 1);

    // Rev up and keep it there past the hysteresis delay
    sim.set_rpm(4000);
    wait_for("capture disabled", || {
        sim.request_count(Command::SetLoggerSwitch) == 1 && !sim.composite_enabled()
    });
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // Dropping back to idle re-arms the gate and reopens fresh sinks
    sim.set_rpm(0);
    sim.queue_composite_events(&[sample_event(2)]);
    wait_for("capture re-enabled", || sim.composite_enabled());
    wait_for("sinks reopened", || opens.load(Ordering::SeqCst) == 2);
    assert_eq!(sim.request_count(Command::SetLoggerSwitch), 1);

    connection.close();
}

#[test]
fn test_stream_death_closes_the_connection() {
    let (mut sim, link) = SimEcu::start(CONFIG_SIZE, OUTPUTS_SIZE).unwrap();
    let connection = ConnectionBuilder::new(Box::new(link), test_profile())
        .config(fast_config())
        .build()
        .unwrap();
    assert!(connection.connect());

    sim.shutdown();

    wait_for("connection closed", || connection.is_closed());
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[test]
fn test_drop_mid_tick_shuts_down_quietly() {
    static PANICKED: AtomicBool = AtomicBool::new(false);
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        PANICKED.store(true, Ordering::SeqCst);
        previous(info);
    }));

    for _ in 0..3 {
        let (_sim, link) = SimEcu::start(CONFIG_SIZE, OUTPUTS_SIZE).unwrap();
        let connection = ConnectionBuilder::new(Box::new(link), test_profile())
            .config(fast_config())
            .build()
            .unwrap();
        assert!(connection.connect());
        // Let a tick start and sit in its console pause, so the tick job
        // is holding the last live reference when the owner lets go
        thread::sleep(Duration::from_millis(60));
        drop(connection);
        thread::sleep(Duration::from_millis(250));
    }

    assert!(
        !PANICKED.load(Ordering::SeqCst),
        "a background thread panicked"
    );
}

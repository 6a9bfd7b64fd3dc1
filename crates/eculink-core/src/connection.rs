//! Connection lifecycle
//!
//! `EcuConnection` ties the pieces together: a byte channel with its reader
//! pump, the command engine, the io worker, the configuration image, the
//! telemetry poller and the composite logger. Connections are built with
//! [`ConnectionBuilder`], live until [`EcuConnection::close`], and are never
//! reused afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::composite::{
    CompositeLogger, NullSinkFactory, SinkFactory, COMPOSITE_OFF_RPM, HIGH_RPM_DELAY,
};
use crate::image::sync::ImageSync;
use crate::image::{ConfigurationImage, ImageCell, ImageStore, NullImageStore};
use crate::protocol::transport::spawn_reader;
use crate::protocol::{
    ByteChannel, CommandEngine, PacketAssembler, ProtocolError, BLOCKING_FACTOR,
};
use crate::telemetry::registry::{ListenerId, SensorRegistry};
use crate::telemetry::{self, poller, Sensor, RPM_CHANNEL};
use crate::worker::IoWorker;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Built but the configuration has not been acquired yet
    NotConnected,
    /// Configuration acquired, poller running
    Connected,
    /// Closed; terminal
    Closed,
}

/// Timeouts and tuning knobs for a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Deadline for a single request/response exchange
    pub io_timeout: Duration,
    /// Wall-clock bound for reading the full configuration at connect
    pub read_image_timeout: Duration,
    /// Bound on waiting for a dispatched console command
    pub command_timeout: Duration,
    /// Telemetry poll period
    pub poll_period: Duration,
    /// RPM at or below which composite capture is wanted
    pub composite_off_rpm: f64,
    /// How long RPM must stay high before capture turns off
    pub high_rpm_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(30),
            read_image_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(30),
            poll_period: Duration::from_millis(100),
            composite_off_rpm: COMPOSITE_OFF_RPM,
            high_rpm_delay: HIGH_RPM_DELAY,
        }
    }
}

/// What the firmware on the other end looks like
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Size of the configuration image in bytes
    pub total_config_size: usize,
    /// Size of the output-channel snapshot in bytes
    pub outputs_size: usize,
    /// Output-channel layout
    pub sensors: Vec<Sensor>,
}

impl DeviceProfile {
    /// Profile matching the standard firmware layout
    pub fn standard() -> Self {
        Self {
            total_config_size: 20_000,
            outputs_size: 128,
            sensors: telemetry::standard_sensors(),
        }
    }
}

/// Observer hooks, all optional
#[derive(Default)]
pub(crate) struct ConnectionCallbacks {
    pub on_data_arrived: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_state: Option<Box<dyn Fn(ConnectionState) + Send + Sync>>,
    pub on_console_text: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_confirmation: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_live_docs: Option<Box<dyn Fn() + Send + Sync>>,
}

pub(crate) struct ConnectionInner {
    pub engine: CommandEngine,
    pub packets: Arc<PacketAssembler>,
    pub image: ImageCell,
    pub burn_pending: AtomicBool,
    pub sensors: Arc<SensorRegistry>,
    pub composite: CompositeLogger,
    pub callbacks: ConnectionCallbacks,
    pub store: Box<dyn ImageStore>,
    pub profile: DeviceProfile,
    pub config: ConnectionConfig,
    pub closed: Arc<AtomicBool>,
    pub state: Mutex<ConnectionState>,
    pub latest_outputs: Mutex<Option<Vec<u8>>>,
    pub rpm_listener: Mutex<Option<ListenerId>>,
    pub worker: IoWorker,
}

impl ConnectionInner {
    pub(crate) fn sync(&self) -> ImageSync<'_> {
        ImageSync {
            engine: &self.engine,
            store: self.store.as_ref(),
            total_size: self.profile.total_config_size,
            read_timeout: self.config.read_image_timeout,
            burn_pending: &self.burn_pending,
            on_chunk: self.callbacks.on_data_arrived.as_deref(),
        }
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == next {
                return;
            }
            *state = next;
        }
        info!(?next, "Connection state changed");
        if let Some(on_state) = &self.callbacks.on_state {
            on_state(next);
        }
    }

    fn connect_on_worker(self: &Arc<Self>) -> bool {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state != ConnectionState::NotConnected {
            return state == ConnectionState::Connected;
        }
        let Some(image) = self.sync().acquire() else {
            warn!("Could not obtain a configuration, staying disconnected");
            return false;
        };
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.image.replace(&image);
        self.set_state(ConnectionState::Connected);

        // The composite gate follows engine speed
        let gate = self.composite.gate();
        let listener = self.sensors.subscribe(
            RPM_CHANNEL,
            Arc::new(move |rpm| {
                gate.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .on_rpm(rpm, Instant::now());
            }),
        );
        *self
            .rpm_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);

        poller::spawn(Arc::downgrade(self));
        true
    }

    /// Tear everything down; callable from any thread, idempotent
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing connection");
        if let Some(listener) = self
            .rpm_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.sensors.unsubscribe(listener);
        }
        // Wake anything blocked on a response, then drop the transport
        self.packets.shutdown();
        self.engine.shutdown_transport();
        self.composite.close_sinks();
        self.set_state(ConnectionState::Closed);
    }
}

/// Builder for [`EcuConnection`]
pub struct ConnectionBuilder {
    channel: Box<dyn ByteChannel>,
    profile: DeviceProfile,
    config: ConnectionConfig,
    store: Box<dyn ImageStore>,
    sink_factory: Box<dyn SinkFactory>,
    sensors: Option<Arc<SensorRegistry>>,
    callbacks: ConnectionCallbacks,
}

impl ConnectionBuilder {
    /// Start building a connection over `channel` to a device shaped like
    /// `profile`
    pub fn new(channel: Box<dyn ByteChannel>, profile: DeviceProfile) -> Self {
        Self {
            channel,
            profile,
            config: ConnectionConfig::default(),
            store: Box::new(NullImageStore),
            sink_factory: Box::new(NullSinkFactory),
            sensors: None,
            callbacks: ConnectionCallbacks::default(),
        }
    }

    /// Override the default timeouts
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist the configuration image through `store`
    pub fn image_store(mut self, store: Box<dyn ImageStore>) -> Self {
        self.store = store;
        self
    }

    /// Write composite events to sinks opened by `factory`
    pub fn sink_factory(mut self, factory: Box<dyn SinkFactory>) -> Self {
        self.sink_factory = factory;
        self
    }

    /// Share a sensor registry instead of owning a fresh one
    pub fn sensors(mut self, sensors: Arc<SensorRegistry>) -> Self {
        self.sensors = Some(sensors);
        self
    }

    /// Invoked whenever bytes arrive from the device
    pub fn on_data_arrived(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_data_arrived = Some(Box::new(hook));
        self
    }

    /// Invoked on every connection state change
    pub fn on_state_change(
        mut self,
        hook: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_state = Some(Box::new(hook));
        self
    }

    /// Invoked with console text pulled from the device
    pub fn on_console_text(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_console_text = Some(Box::new(hook));
        self
    }

    /// Invoked once a dispatched console command completes in time
    pub fn on_confirmation(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_confirmation = Some(Box::new(hook));
        self
    }

    /// Invoked once per poll tick for live-documentation refresh
    pub fn on_live_docs(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_live_docs = Some(Box::new(hook));
        self
    }

    /// Spawn the reader and worker threads and assemble the connection.
    ///
    /// The connection starts in [`ConnectionState::NotConnected`]; call
    /// [`EcuConnection::connect`] to acquire the configuration and start
    /// polling.
    pub fn build(self) -> Result<EcuConnection, ProtocolError> {
        // Page-read offsets travel as u16
        if self.profile.total_config_size > u16::MAX as usize + 1 {
            return Err(ProtocolError::ProfileTooLarge(self.profile.total_config_size));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let packets = Arc::new(PacketAssembler::new(
            BLOCKING_FACTOR.max(self.profile.outputs_size) + 1,
        ));
        let reader_half = self.channel.try_clone()?;
        spawn_reader(reader_half, packets.clone(), closed.clone())?;

        let worker = IoWorker::spawn("ecu io")?;
        let engine = CommandEngine::new(
            self.channel,
            packets.clone(),
            closed.clone(),
            self.config.io_timeout,
        );
        engine.bind_worker(worker.thread_id());

        let composite = CompositeLogger::new(
            self.sink_factory,
            self.config.composite_off_rpm,
            self.config.high_rpm_delay,
        );

        let inner = Arc::new(ConnectionInner {
            engine,
            packets,
            image: ImageCell::empty(),
            burn_pending: AtomicBool::new(false),
            sensors: self.sensors.unwrap_or_default(),
            composite,
            callbacks: self.callbacks,
            store: self.store,
            profile: self.profile,
            config: self.config,
            closed,
            state: Mutex::new(ConnectionState::NotConnected),
            latest_outputs: Mutex::new(None),
            rpm_listener: Mutex::new(None),
            worker,
        });

        // A transport failure anywhere closes the whole connection
        let weak = Arc::downgrade(&inner);
        inner.engine.set_close_hook(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.close();
            }
        }));

        Ok(EcuConnection { inner })
    }
}

/// A live session with one device
pub struct EcuConnection {
    inner: Arc<ConnectionInner>,
}

impl EcuConnection {
    /// Acquire the configuration and start polling.
    ///
    /// Blocks until the image is obtained (from the cache when its checksum
    /// matches the device, otherwise read page by page) or the attempt
    /// fails. Returns `false` when no image could be obtained; the
    /// connection then stays in [`ConnectionState::NotConnected`] and no
    /// poller is started.
    pub fn connect(&self) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        let weak = Arc::downgrade(&self.inner);
        let result = self.inner.worker.call(
            move || match weak.upgrade() {
                Some(inner) => inner.connect_on_worker(),
                None => false,
            },
            None,
        );
        matches!(result, Ok(true))
    }

    /// Diff `new_image` against the current configuration, write the
    /// differing bytes and burn them to flash
    pub fn upload_changes(&self, new_image: &ConfigurationImage) -> Result<(), ProtocolError> {
        let new_image = new_image.clone();
        let weak = Arc::downgrade(&self.inner);
        self.inner.worker.call(
            move || match weak.upgrade() {
                Some(inner) => inner.sync().upload(&inner.image, &new_image),
                None => Err(ProtocolError::Closed),
            },
            None,
        )?
    }

    /// Commit any pending configuration writes to device flash
    pub fn burn(&self) -> Result<(), ProtocolError> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.worker.call(
            move || match weak.upgrade() {
                Some(inner) => inner.sync().burn(),
                None => Err(ProtocolError::Closed),
            },
            None,
        )?
    }

    /// Send a console command and wait for the acknowledgement.
    ///
    /// Returns `true` when the device never acknowledged within the io
    /// timeout.
    pub fn send_text_command(&self, text: &str) -> bool {
        let text = text.to_string();
        let weak = Arc::downgrade(&self.inner);
        let result = self.inner.worker.call(
            move || match weak.upgrade() {
                Some(inner) => inner.engine.send_text_command(&text),
                None => true,
            },
            None,
        );
        result.unwrap_or(true)
    }

    /// Dispatch a console command, wait up to the command timeout, and fire
    /// the confirmation hook once the attempt finishes
    pub fn send_command(&self, text: &str) {
        let sent = text.to_string();
        let weak = Arc::downgrade(&self.inner);
        let result = self.inner.worker.call(
            move || match weak.upgrade() {
                Some(inner) => inner.engine.send_text_command(&sent),
                None => true,
            },
            Some(self.inner.config.command_timeout),
        );
        match result {
            Ok(timed_out) => {
                if timed_out {
                    warn!("Command {:?} was not acknowledged", text);
                }
                if let Some(on_confirmation) = &self.inner.callbacks.on_confirmation {
                    on_confirmation(text);
                }
            }
            Err(e) => error!("Timed out dispatching {:?}: {}", text, e),
        }
    }

    /// Clone of the authoritative configuration, if connected
    pub fn configuration(&self) -> Option<ConfigurationImage> {
        self.inner.image.snapshot()
    }

    /// Most recent raw output-channel snapshot
    pub fn latest_outputs(&self) -> Option<Vec<u8>> {
        self.inner
            .latest_outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a chunk write has not been burned yet
    pub fn burn_pending(&self) -> bool {
        self.inner.burn_pending.load(Ordering::SeqCst)
    }

    /// The sensor registry this connection publishes into
    pub fn sensors(&self) -> Arc<SensorRegistry> {
        self.inner.sensors.clone()
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the connection; idempotent, callable from any thread
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for EcuConnection {
    fn drop(&mut self) {
        self.inner.close();
    }
}

pub(crate) type WeakConnection = Weak<ConnectionInner>;

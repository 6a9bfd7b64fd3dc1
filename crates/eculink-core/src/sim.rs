//! In-memory device simulator
//!
//! A scriptable stand-in for real firmware. [`SimEcu`] services the device
//! side of the protocol over an in-memory duplex channel, so integration
//! tests, examples and demo modes can run complete sessions without
//! hardware: it owns a mutable configuration image, serves telemetry
//! snapshots (optionally with a jittered RPM), queues console text and
//! composite events, counts requests per command, and can swallow responses
//! to simulate a flaky link.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::composite::{CompositeEvent, EVENT_SIZE};
use crate::protocol::commands::{
    self, Command, COMPOSITE_DISABLE, RESPONSE_BURN_OK, RESPONSE_COMMAND_OK, RESPONSE_OK,
};
use crate::protocol::{packet, ByteChannel, PacketAssembler, BLOCKING_FACTOR};

/// How long the simulator waits for inbound bytes per poll
const SIM_READ_POLL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    dead: bool,
}

struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn new() -> Self {
        Self {
            state: Mutex::new(PipeState::default()),
            ready: Condvar::new(),
        }
    }

    fn kill(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.dead = true;
        drop(state);
        self.ready.notify_all();
    }
}

/// One end of an in-memory duplex byte link
pub struct MemoryChannel {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    read_timeout: Duration,
}

/// Create a connected pair of in-memory channel ends
pub fn memory_duplex() -> (MemoryChannel, MemoryChannel) {
    let a = Arc::new(Pipe::new());
    let b = Arc::new(Pipe::new());
    let left = MemoryChannel {
        rx: a.clone(),
        tx: b.clone(),
        read_timeout: Duration::from_millis(100),
    };
    let right = MemoryChannel {
        rx: b,
        tx: a,
        read_timeout: Duration::from_millis(100),
    };
    (left, right)
}

impl MemoryChannel {
    /// Mark both directions dead, as if the cable was pulled
    pub fn kill(&self) {
        self.rx.kill();
        self.tx.kill();
    }

    fn shared_clone(&self) -> MemoryChannel {
        MemoryChannel {
            rx: self.rx.clone(),
            tx: self.tx.clone(),
            read_timeout: self.read_timeout,
        }
    }
}

impl Read for MemoryChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + self.read_timeout;
        let mut state = self.rx.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if !state.data.is_empty() {
                let n = buf.len().min(state.data.len());
                for slot in buf.iter_mut().take(n) {
                    if let Some(byte) = state.data.pop_front() {
                        *slot = byte;
                    }
                }
                return Ok(n);
            }
            if state.dead {
                return Ok(0);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::ErrorKind::TimedOut.into());
            }
            let (next, _) = self
                .rx
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
    }
}

impl Write for MemoryChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.tx.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.dead {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.data.extend(buf);
        drop(state);
        self.tx.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteChannel for MemoryChannel {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn purge(&mut self) -> io::Result<()> {
        self.rx
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .data
            .clear();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteChannel>> {
        Ok(Box::new(self.shared_clone()))
    }
}

struct SimState {
    image: Mutex<Vec<u8>>,
    outputs: Mutex<Vec<u8>>,
    console: Mutex<VecDeque<String>>,
    composite_queue: Mutex<Vec<CompositeEvent>>,
    text_commands: Mutex<Vec<String>>,
    requests: Mutex<HashMap<u8, usize>>,
    swallow: Mutex<HashMap<u8, usize>>,
    composite_enabled: AtomicBool,
    base_rpm: AtomicI32,
    rpm_jitter: AtomicI32,
    rng: Mutex<StdRng>,
}

impl SimState {
    fn new(config_size: usize, outputs_size: usize) -> Self {
        Self {
            image: Mutex::new(vec![0; config_size]),
            outputs: Mutex::new(vec![0; outputs_size]),
            console: Mutex::new(VecDeque::new()),
            composite_queue: Mutex::new(Vec::new()),
            text_commands: Mutex::new(Vec::new()),
            requests: Mutex::new(HashMap::new()),
            swallow: Mutex::new(HashMap::new()),
            composite_enabled: AtomicBool::new(false),
            base_rpm: AtomicI32::new(0),
            rpm_jitter: AtomicI32::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(42)),
        }
    }

    fn bump(&self, code: u8) {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        *requests.entry(code).or_insert(0) += 1;
    }

    fn should_swallow(&self, code: u8) -> bool {
        let mut swallow = self.swallow.lock().unwrap_or_else(PoisonError::into_inner);
        match swallow.get_mut(&code) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn service(&self, request: &[u8]) -> Option<Vec<u8>> {
        let code = *request.first()?;
        self.bump(code);

        if self.should_swallow(code) {
            debug!(code, "Swallowing response");
            return None;
        }

        let Some(command) = Command::from_code(code) else {
            warn!(code, "Unknown command, staying silent");
            return None;
        };
        match command {
            Command::ReadPage => self.read_page(request),
            Command::ChunkWrite => self.chunk_write(request),
            Command::Burn => Some(vec![RESPONSE_BURN_OK]),
            Command::CrcCheck => Some(self.crc_response()),
            Command::OutputChannels => self.outputs_response(request),
            Command::ExecuteText => Some(self.execute_text(request)),
            Command::GetText => Some(self.text_response()),
            Command::GetCompositeBuffer => Some(self.composite_response()),
            Command::SetLoggerSwitch => Some(self.logger_switch(request)),
        }
    }

    fn paged_range(&self, request: &[u8]) -> Option<(usize, usize)> {
        if request.len() < 7 {
            return None;
        }
        let offset = commands::swap16(BigEndian::read_u16(&request[3..5])) as usize;
        let count = commands::swap16(BigEndian::read_u16(&request[5..7])) as usize;
        Some((offset, count))
    }

    fn read_page(&self, request: &[u8]) -> Option<Vec<u8>> {
        let (offset, count) = self.paged_range(request)?;
        let image = self.image.lock().unwrap_or_else(PoisonError::into_inner);
        let end = offset.checked_add(count)?;
        if end > image.len() {
            warn!(offset, count, "Rejecting out-of-range page read");
            return None;
        }
        let mut response = Vec::with_capacity(count + 1);
        response.push(RESPONSE_OK);
        response.extend_from_slice(&image[offset..end]);
        Some(response)
    }

    fn chunk_write(&self, request: &[u8]) -> Option<Vec<u8>> {
        let (offset, count) = self.paged_range(request)?;
        let data = request.get(7..)?;
        if data.len() != count {
            warn!(
                offset,
                count,
                got = data.len(),
                "Rejecting chunk write with inconsistent length"
            );
            return None;
        }
        let mut image = self.image.lock().unwrap_or_else(PoisonError::into_inner);
        let end = offset.checked_add(count)?;
        if end > image.len() {
            warn!(offset, count, "Rejecting out-of-range chunk write");
            return None;
        }
        image[offset..end].copy_from_slice(data);
        Some(vec![RESPONSE_OK])
    }

    fn crc_response(&self) -> Vec<u8> {
        let crc = {
            let image = self.image.lock().unwrap_or_else(PoisonError::into_inner);
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&image);
            hasher.finalize()
        };
        let mut response = vec![RESPONSE_OK, 0, 0, 0, 0];
        BigEndian::write_u32(&mut response[1..5], crc);
        response
    }

    fn outputs_response(&self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < 5 {
            return None;
        }
        let count = commands::swap16(BigEndian::read_u16(&request[3..5])) as usize;
        let mut served = self
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let amplitude = self.rpm_jitter.load(Ordering::SeqCst);
        if amplitude > 0 && served.len() >= 4 {
            let base = self.base_rpm.load(Ordering::SeqCst);
            let wobble = self
                .rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .gen_range(-amplitude..=amplitude);
            LittleEndian::write_i32(&mut served[0..4], base + wobble);
        }

        served.resize(count, 0);
        let mut response = Vec::with_capacity(count + 1);
        response.push(RESPONSE_OK);
        response.extend_from_slice(&served);
        Some(response)
    }

    fn execute_text(&self, request: &[u8]) -> Vec<u8> {
        let text = String::from_utf8_lossy(request.get(1..).unwrap_or(&[])).into_owned();
        debug!(%text, "Executing console command");
        self.text_commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text);
        vec![RESPONSE_COMMAND_OK]
    }

    fn text_response(&self) -> Vec<u8> {
        let mut response = vec![RESPONSE_OK];
        if let Some(line) = self
            .console
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            response.extend_from_slice(line.as_bytes());
        }
        response
    }

    fn composite_response(&self) -> Vec<u8> {
        // Asking for data switches capture on, like the real firmware
        self.composite_enabled.store(true, Ordering::SeqCst);
        let events: Vec<CompositeEvent> = self
            .composite_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut response = Vec::with_capacity(1 + events.len() * EVENT_SIZE);
        response.push(RESPONSE_OK);
        for event in &events {
            let mut record = [0u8; EVENT_SIZE];
            BigEndian::write_u32(&mut record[0..4], event.timestamp);
            let mut flags = 0u8;
            if event.primary_trigger {
                flags |= 1;
            }
            if event.secondary_trigger {
                flags |= 2;
            }
            if event.trigger {
                flags |= 4;
            }
            if event.sync {
                flags |= 8;
            }
            if event.coil {
                flags |= 16;
            }
            if event.injector {
                flags |= 32;
            }
            record[4] = flags;
            response.extend_from_slice(&record);
        }
        response
    }

    fn logger_switch(&self, request: &[u8]) -> Vec<u8> {
        if request.get(1) == Some(&COMPOSITE_DISABLE) {
            self.composite_enabled.store(false, Ordering::SeqCst);
        }
        vec![RESPONSE_OK]
    }
}

/// Handle to a running simulated device
pub struct SimEcu {
    state: Arc<SimState>,
    link: MemoryChannel,
    handle: Option<JoinHandle<()>>,
}

impl SimEcu {
    /// Start a simulated device with a zeroed configuration of
    /// `config_size` bytes and an outputs snapshot of `outputs_size` bytes;
    /// returns the host end of the link
    pub fn start(config_size: usize, outputs_size: usize) -> io::Result<(SimEcu, MemoryChannel)> {
        let (host, device) = memory_duplex();
        let state = Arc::new(SimState::new(config_size, outputs_size));

        let control = device.shared_clone();
        let run_state = state.clone();
        let handle = thread::Builder::new()
            .name("sim ecu".into())
            .spawn(move || run(device, run_state))?;

        Ok((
            SimEcu {
                state,
                link: control,
                handle: Some(handle),
            },
            host,
        ))
    }

    /// Snapshot of the device-held configuration
    pub fn image(&self) -> Vec<u8> {
        self.state
            .image
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Overwrite configuration bytes at `offset`, e.g. to make a host cache
    /// stale
    pub fn patch_image(&self, offset: usize, bytes: &[u8]) {
        let mut image = self
            .state
            .image
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let end = (offset + bytes.len()).min(image.len());
        if offset < end {
            let span = end - offset;
            image[offset..end].copy_from_slice(&bytes[..span]);
        }
    }

    /// Set the RPM served in the outputs snapshot
    pub fn set_rpm(&self, rpm: i32) {
        self.state.base_rpm.store(rpm, Ordering::SeqCst);
        let mut outputs = self
            .state
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if outputs.len() >= 4 {
            LittleEndian::write_i32(&mut outputs[0..4], rpm);
        }
    }

    /// Add a random wobble of up to `amplitude` RPM to every served
    /// snapshot
    pub fn set_rpm_jitter(&self, amplitude: i32) {
        self.state.rpm_jitter.store(amplitude, Ordering::SeqCst);
    }

    /// Write raw bytes into the outputs snapshot at `offset`
    pub fn write_outputs(&self, offset: usize, bytes: &[u8]) {
        let mut outputs = self
            .state
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let end = (offset + bytes.len()).min(outputs.len());
        if offset < end {
            let span = end - offset;
            outputs[offset..end].copy_from_slice(&bytes[..span]);
        }
    }

    /// Queue a console line for the next pending-text pull
    pub fn push_console_line(&self, text: &str) {
        self.state
            .console
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(text.to_string());
    }

    /// Queue composite events for the next buffer fetch
    pub fn queue_composite_events(&self, events: &[CompositeEvent]) {
        self.state
            .composite_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(events);
    }

    /// Console commands executed so far
    pub fn text_commands(&self) -> Vec<String> {
        self.state
            .text_commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many requests carried this command
    pub fn request_count(&self, command: Command) -> usize {
        self.state
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&command.code())
            .copied()
            .unwrap_or(0)
    }

    /// Whether device-side composite capture is currently on
    pub fn composite_enabled(&self) -> bool {
        self.state.composite_enabled.load(Ordering::SeqCst)
    }

    /// Swallow the next `n` responses to `command`; the requests are still
    /// counted, the host just never hears back
    pub fn swallow_next_responses(&self, command: Command, n: usize) {
        let mut swallow = self
            .state
            .swallow
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *swallow.entry(command.code()).or_insert(0) += n;
    }

    /// Stop the simulated device and sever the link
    pub fn shutdown(&mut self) {
        self.link.kill();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimEcu {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(mut link: MemoryChannel, state: Arc<SimState>) {
    info!("Simulated device up");
    if link.set_read_timeout(SIM_READ_POLL).is_err() {
        return;
    }
    // Requests arrive in the same envelope the host reads, so the same
    // assembler serves the device side
    let packets = PacketAssembler::new(BLOCKING_FACTOR + 16);
    let mut buf = [0u8; 4096];
    loop {
        match link.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => packets.push(&buf[..n]),
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }
        while let Ok(Some(request)) = packets.next_packet(Instant::now(), true) {
            if let Some(response) = state.service(&request) {
                if link.write_all(&packet::encode(&response)).is_err() {
                    info!("Simulated device down");
                    return;
                }
            }
        }
    }
    info!("Simulated device down");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run one framed exchange against the device end of `link`
    fn exchange(link: &mut MemoryChannel, request: &[u8]) -> Vec<u8> {
        link.write_all(&packet::encode(request)).unwrap();
        let packets = PacketAssembler::new(512);
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut buf = [0u8; 1024];
        loop {
            if let Ok(Some(payload)) = packets.next_packet(Instant::now(), true) {
                return payload;
            }
            assert!(Instant::now() < deadline, "no response from simulator");
            match link.read(&mut buf) {
                Ok(n) => packets.push(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => panic!("link failed: {}", e),
            }
        }
    }

    #[test]
    fn test_duplex_carries_bytes_both_ways() {
        let (mut left, mut right) = memory_duplex();
        left.write_all(b"ping").unwrap();
        right.write_all(b"pong").unwrap();

        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        left.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_read_times_out_when_idle() {
        let (mut left, _right) = memory_duplex();
        left.set_read_timeout(Duration::from_millis(20)).unwrap();

        let mut buf = [0u8; 1];
        let err = left.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_kill_yields_eof() {
        let (mut left, right) = memory_duplex();
        right.kill();

        let mut buf = [0u8; 8];
        assert_eq!(left.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_sim_answers_crc_check() {
        let (sim, mut host) = SimEcu::start(256, 64).unwrap();
        sim.patch_image(0, &[1, 2, 3, 4]);

        let response = exchange(&mut host, &commands::crc_check());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&sim.image());
        let expected = hasher.finalize();
        assert_eq!(response.len(), 5);
        assert_eq!(response[0], RESPONSE_OK);
        assert_eq!(BigEndian::read_u32(&response[1..5]), expected);
    }

    #[test]
    fn test_sim_serves_page_reads() {
        let (sim, mut host) = SimEcu::start(256, 64).unwrap();
        sim.patch_image(10, &[0xAA, 0xBB, 0xCC]);

        let response = exchange(&mut host, &commands::read_page(10, 3));

        assert_eq!(response, vec![RESPONSE_OK, 0xAA, 0xBB, 0xCC]);
        assert_eq!(sim.request_count(Command::ReadPage), 1);
    }

    #[test]
    fn test_swallowed_response_still_counts_the_request() {
        let (sim, mut host) = SimEcu::start(64, 16).unwrap();
        sim.swallow_next_responses(Command::Burn, 1);

        host.write_all(&packet::encode(&commands::burn())).unwrap();
        host.set_read_timeout(Duration::from_millis(50)).unwrap();
        let mut buf = [0u8; 16];
        let err = host.read(&mut buf).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(sim.request_count(Command::Burn), 1);
    }

    #[test]
    fn test_sim_tracks_logger_switch() {
        let (sim, mut host) = SimEcu::start(64, 16).unwrap();

        let fetched = exchange(&mut host, &commands::get_composite_buffer());
        assert_eq!(fetched, vec![RESPONSE_OK]);
        assert!(sim.composite_enabled());

        let disabled = exchange(&mut host, &commands::set_logger_switch(COMPOSITE_DISABLE));
        assert_eq!(disabled, vec![RESPONSE_OK]);
        assert!(!sim.composite_enabled());
    }
}

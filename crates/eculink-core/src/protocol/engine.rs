//! Command engine
//!
//! One request/response exchange at a time: an exclusive io lock is held
//! across purge, send and receive, so concurrent callers can never
//! interleave frames or steal each other's responses. Exchanges run on the
//! connection's io worker thread; once the engine is bound to that thread,
//! running a command anywhere else is a programming error.
//!
//! Failure policy: a timeout or malformed response yields `None` and the
//! caller may retry; a transport failure closes the whole connection.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{error, trace};

use super::assembler::PacketAssembler;
use super::commands::{self, RESPONSE_COMMAND_OK};
use super::transport::ByteChannel;
use super::{packet, ProtocolError};

struct WireIo {
    channel: Option<Box<dyn ByteChannel>>,
}

/// Serialized command execution over one byte channel
pub struct CommandEngine {
    io: Mutex<WireIo>,
    packets: Arc<PacketAssembler>,
    closed: Arc<AtomicBool>,
    io_timeout: Duration,
    worker_thread: OnceLock<ThreadId>,
    close_hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl CommandEngine {
    /// Create an engine over `channel`, receiving packets from `packets`
    pub fn new(
        channel: Box<dyn ByteChannel>,
        packets: Arc<PacketAssembler>,
        closed: Arc<AtomicBool>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            io: Mutex::new(WireIo {
                channel: Some(channel),
            }),
            packets,
            closed,
            io_timeout,
            worker_thread: OnceLock::new(),
            close_hook: OnceLock::new(),
        }
    }

    /// Designate the only thread allowed to run exchanges
    pub fn bind_worker(&self, id: ThreadId) {
        let _ = self.worker_thread.set(id);
    }

    /// Install the hook invoked when a transport failure closes the
    /// connection
    pub fn set_close_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        let _ = self.close_hook.set(hook);
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run one request/response exchange.
    ///
    /// Returns `None` when the connection is closed, the response times
    /// out, or the response frame is malformed; the two latter cases are
    /// safe to retry. A transport failure closes the connection.
    pub fn execute_command(
        &self,
        request: &[u8],
        what: &str,
        allow_long: bool,
    ) -> Option<Vec<u8>> {
        if self.is_closed() {
            return None;
        }
        self.assert_worker_thread();

        let result = {
            let mut io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
            // Late responses from an earlier, timed-out exchange must not
            // be mistaken for this one
            self.packets.drop_pending();
            self.exchange(&mut io, request, allow_long)
        };

        match result {
            Ok(response) => {
                trace!(what, got = response.is_some(), "Exchange finished");
                response
            }
            Err(e) => {
                error!("{}: command failed: {}", what, e);
                self.fatal_close();
                None
            }
        }
    }

    fn exchange(
        &self,
        io: &mut WireIo,
        request: &[u8],
        allow_long: bool,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let channel = io.channel.as_mut().ok_or(ProtocolError::Closed)?;
        channel.purge()?;

        let deadline = Instant::now() + self.io_timeout;
        let frame = packet::encode(request);
        channel.write_all(&frame)?;
        channel.flush()?;

        self.packets.next_packet(deadline, allow_long)
    }

    /// Send a text console command, retrying until the device acknowledges
    /// or the io timeout elapses. Returns `true` when it timed out.
    pub fn send_text_command(&self, text: &str) -> bool {
        let request = commands::execute_text(text);
        let deadline = Instant::now() + self.io_timeout;
        while !self.is_closed() && Instant::now() < deadline {
            if let Some(response) = self.execute_command(&request, "execute", false) {
                if response.len() == 1 && response[0] == RESPONSE_COMMAND_OK {
                    return false;
                }
            }
        }
        true
    }

    /// Drop the transport so the peer sees the stream end
    pub(crate) fn shutdown_transport(&self) {
        let mut io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        io.channel = None;
    }

    fn assert_worker_thread(&self) {
        if let Some(expected) = self.worker_thread.get() {
            assert_eq!(
                thread::current().id(),
                *expected,
                "command executed off the io worker thread"
            );
        }
    }

    fn fatal_close(&self) {
        if let Some(hook) = self.close_hook.get() {
            hook();
        } else {
            self.closed.store(true, Ordering::SeqCst);
            self.packets.shutdown();
            self.shutdown_transport();
        }
    }
}

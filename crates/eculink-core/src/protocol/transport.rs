//! Byte-stream transports
//!
//! The connection talks to the device over an already-open byte channel;
//! opening or discovering ports is the embedder's job. A reader pump thread
//! owns a clone of the channel and feeds every received byte into the
//! packet assembler until the stream dies or the connection closes.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use super::assembler::PacketAssembler;

/// How long a pump read waits before re-checking the closed flag
const READER_POLL: Duration = Duration::from_millis(100);

/// Abstraction for device byte streams (serial or TCP)
pub trait ByteChannel: Read + Write + Send {
    /// Set the timeout for blocking reads
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard any unread input
    fn purge(&mut self) -> io::Result<()>;

    /// Clone the channel so a reader thread can own one half
    fn try_clone(&self) -> io::Result<Box<dyn ByteChannel>>;
}

/// Serial port wrapper implementing [`ByteChannel`]
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an already-open serial port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl ByteChannel for SerialChannel {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn purge(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteChannel>> {
        let port = self
            .port
            .try_clone()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Box::new(SerialChannel::new(port)))
    }
}

/// TCP stream wrapper implementing [`ByteChannel`]
pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    /// Wrap a connected TCP stream
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl ByteChannel for TcpChannel {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))
    }

    // TCP has no input-clear syscall; drain with non-blocking reads instead
    fn purge(&mut self) -> io::Result<()> {
        self.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let _ = self.stream.set_nonblocking(false);
                    return Err(e);
                }
            }
        }
        self.stream.set_nonblocking(false)?;
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteChannel>> {
        Ok(Box::new(TcpChannel::new(self.stream.try_clone()?)))
    }
}

/// Spawn the reader pump feeding `assembler` from `channel`
pub(crate) fn spawn_reader(
    mut channel: Box<dyn ByteChannel>,
    assembler: Arc<PacketAssembler>,
    closed: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    channel.set_read_timeout(READER_POLL)?;
    std::thread::Builder::new()
        .name("ecu reader".into())
        .spawn(move || {
            let mut buf = [0u8; 256];
            loop {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                match channel.read(&mut buf) {
                    Ok(0) => {
                        debug!("Stream end reached");
                        break;
                    }
                    Ok(n) => assembler.push(&buf[..n]),
                    Err(e)
                        if e.kind() == io::ErrorKind::TimedOut
                            || e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        continue;
                    }
                    Err(e) => {
                        if !closed.load(Ordering::SeqCst) {
                            warn!("Reader failed: {}", e);
                        }
                        break;
                    }
                }
            }
            assembler.shutdown();
            debug!("Reader pump stopped");
        })
}

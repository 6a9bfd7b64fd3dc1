//! Configuration synchronization
//!
//! Connect-time acquisition (cache validation against the device checksum,
//! else a chunked full read), differential upload and burn. Every exchange
//! goes through the command engine and therefore runs on the io worker
//! thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info, warn};

use crate::protocol::commands::{self, RESPONSE_BURN_OK, RESPONSE_OK};
use crate::protocol::{CommandEngine, ProtocolError, BLOCKING_FACTOR};

use super::diff::next_difference;
use super::{ConfigurationImage, ImageCell, ImageStore};

/// Image synchronization driver, borrowed from the connection per call
pub(crate) struct ImageSync<'a> {
    pub engine: &'a CommandEngine,
    pub store: &'a dyn ImageStore,
    pub total_size: usize,
    pub read_timeout: Duration,
    pub burn_pending: &'a AtomicBool,
    pub on_chunk: Option<&'a (dyn Fn() + Send + Sync)>,
}

impl ImageSync<'_> {
    /// Acquire the configuration at connect time: reuse a
    /// checksum-validated cache or read everything from the device
    pub fn acquire(&self) -> Option<ConfigurationImage> {
        if let Some(cached) = self.validate_cached() {
            info!("Got configuration from cache");
            return Some(cached);
        }
        let image = self.read_full()?;
        // Best effort; a failed cache or export never fails the connect
        if let Err(e) = self.store.save_cached(&image) {
            warn!("Failed to cache configuration: {}", e);
        }
        if let Err(e) = self.store.export_tune(&image) {
            warn!("Failed to export tune document: {}", e);
        }
        info!("Got configuration from controller");
        Some(image)
    }

    fn validate_cached(&self) -> Option<ConfigurationImage> {
        let cached = match self.store.load_cached() {
            Ok(Some(image)) => image,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to load cached configuration: {}", e);
                return None;
            }
        };
        if cached.len() != self.total_size {
            debug!(
                cached = cached.len(),
                expected = self.total_size,
                "Cached configuration has the wrong size"
            );
            return None;
        }

        let local_crc = cached.crc32();
        let response = self
            .engine
            .execute_command(&commands::crc_check(), "crc check", false)?;
        if response.len() != 5 || response[0] != RESPONSE_OK {
            debug!("Unexpected crc check response, treating cache as stale");
            return None;
        }
        // The device replies big-endian here, unlike the little-endian
        // fields elsewhere in the protocol
        let device_crc = BigEndian::read_u32(&response[1..5]);
        debug!(
            "Local cache CRC {:#010x}, device CRC {:#010x}",
            local_crc, device_crc
        );

        if device_crc == local_crc {
            Some(cached)
        } else {
            None
        }
    }

    fn read_full(&self) -> Option<ConfigurationImage> {
        let mut image = ConfigurationImage::new(self.total_size);
        let mut offset = 0usize;
        let deadline = Instant::now() + self.read_timeout;
        info!("Reading configuration from controller...");

        while offset < self.total_size {
            if self.engine.is_closed() {
                return None;
            }
            if Instant::now() >= deadline {
                warn!(offset, "Full image read timed out");
                return None;
            }
            let count = BLOCKING_FACTOR.min(self.total_size - offset);
            let request = commands::read_page(offset as u16, count as u16);
            let label = format!("load image offset={}", offset);

            match self.engine.execute_command(&request, &label, false) {
                Some(r) if r.len() == count + 1 && r[0] == RESPONSE_OK => {
                    image.as_mut_bytes()[offset..offset + count].copy_from_slice(&r[1..]);
                    if let Some(on_chunk) = self.on_chunk {
                        on_chunk();
                    }
                    offset += count;
                }
                other => {
                    let got = match &other {
                        Some(r) if !r.is_empty() => format!("code {}", r[0]),
                        _ => "empty".to_string(),
                    };
                    // Same chunk again; the deadline bounds this loop
                    warn!("Page read rejected ({}), retrying", got);
                }
            }
        }
        Some(image)
    }

    /// Write `count` bytes of `content` at absolute `offset`, splitting at
    /// the blocking factor and retrying rejected chunks until accepted or
    /// the connection closes
    pub fn write_data(
        &self,
        content: &[u8],
        offset: usize,
        count: usize,
    ) -> Result<(), ProtocolError> {
        // The bytes may reach the device even if the ack gets lost, so a
        // burn is owed from this point on
        self.burn_pending.store(true, Ordering::SeqCst);

        if count > BLOCKING_FACTOR {
            self.write_data(content, offset, BLOCKING_FACTOR)?;
            return self.write_data(content, offset + BLOCKING_FACTOR, count - BLOCKING_FACTOR);
        }

        let request = commands::chunk_write(&content[offset..offset + count], offset as u16);
        loop {
            if self.engine.is_closed() {
                return Err(ProtocolError::Closed);
            }
            match self.engine.execute_command(&request, "write image", false) {
                Some(r) if r.len() == 1 && r[0] == RESPONSE_OK => return Ok(()),
                _ => warn!(offset, "Chunk write rejected, retrying"),
            }
        }
    }

    /// Commit pending configuration writes to device flash
    pub fn burn(&self) -> Result<(), ProtocolError> {
        if !self.burn_pending.load(Ordering::SeqCst) {
            return Ok(());
        }
        info!("Need to burn");
        loop {
            if self.engine.is_closed() {
                return Err(ProtocolError::Closed);
            }
            match self.engine.execute_command(&commands::burn(), "burn", false) {
                Some(r) if r.len() == 1 && r[0] == RESPONSE_BURN_OK => break,
                _ => warn!("Burn not acknowledged, retrying"),
            }
        }
        info!("Burned");
        self.burn_pending.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Diff `new_image` against the authoritative image, write the
    /// differing runs, burn, and swap the new image in
    pub fn upload(
        &self,
        cell: &ImageCell,
        new_image: &ConfigurationImage,
    ) -> Result<(), ProtocolError> {
        let current = cell.snapshot().ok_or(ProtocolError::NotConnected)?;
        if new_image.len() != current.len() {
            return Err(ProtocolError::ImageSizeMismatch {
                expected: current.len(),
                actual: new_image.len(),
            });
        }
        // Private copy nobody else can touch while the upload runs
        let new_image = new_image.clone();

        let mut cursor = 0;
        while cursor < current.len() {
            let Some(range) = next_difference(current.as_bytes(), new_image.as_bytes(), cursor)
            else {
                break;
            };
            info!(
                "Need to patch {}..{} ({} bytes)",
                range.start,
                range.end,
                range.len()
            );
            self.write_data(new_image.as_bytes(), range.start, range.len())?;
            cursor = range.end;
        }
        self.burn()?;
        cell.replace(&new_image);
        Ok(())
    }
}

//! Configuration image
//!
//! The device-held calibration is mirrored host-side as a fixed-size byte
//! image. The authoritative copy lives in an [`ImageCell`] and is only ever
//! exchanged whole: callers clone out, edit their copy, and swap a new copy
//! in, so no caller can alias bytes another thread is changing.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use crc32fast::Hasher;

pub mod diff;
pub mod store;
pub(crate) mod sync;

pub use store::{FileImageStore, ImageStore, NullImageStore};

/// Fixed-size byte image of the device configuration
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigurationImage {
    bytes: Vec<u8>,
}

impl ConfigurationImage {
    /// Create a zero-filled image of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    /// Take ownership of raw image bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Image size in bytes; never changes after construction
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image holds zero bytes
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrow the content
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Borrow the content mutably
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// CRC32 of the whole content, comparable with the device-computed one
    pub fn crc32(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&self.bytes);
        hasher.finalize()
    }
}

impl fmt::Debug for ConfigurationImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationImage")
            .field("len", &self.len())
            .field("crc32", &format_args!("{:#010x}", self.crc32()))
            .finish()
    }
}

/// Guarded slot for the authoritative configuration image.
///
/// The API deliberately admits only whole-image exchange; there is no way
/// to borrow the stored bytes.
pub struct ImageCell {
    slot: Mutex<Option<ConfigurationImage>>,
}

impl ImageCell {
    /// Create an empty cell
    pub fn empty() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Whether an image is present
    pub fn is_present(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Store a private copy of `image` as the authoritative version
    pub fn replace(&self, image: &ConfigurationImage) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(image.clone());
    }

    /// Clone the authoritative image out, if present
    pub fn snapshot(&self) -> Option<ConfigurationImage> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for ImageCell {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_isolated_from_cell() {
        let cell = ImageCell::empty();
        cell.replace(&ConfigurationImage::from_bytes(vec![1, 2, 3]));

        let mut copy = cell.snapshot().unwrap();
        copy.as_mut_bytes()[0] = 99;

        assert_eq!(cell.snapshot().unwrap().as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_replace_stores_private_copy() {
        let cell = ImageCell::empty();
        let mut original = ConfigurationImage::from_bytes(vec![7, 8, 9]);
        cell.replace(&original);

        original.as_mut_bytes()[2] = 0;

        assert_eq!(cell.snapshot().unwrap().as_bytes(), &[7, 8, 9]);
    }

    #[test]
    fn test_crc_tracks_content() {
        let a = ConfigurationImage::from_bytes(vec![0; 64]);
        let mut b = a.clone();
        assert_eq!(a.crc32(), b.crc32());

        b.as_mut_bytes()[10] = 1;
        assert_ne!(a.crc32(), b.crc32());
    }

    #[test]
    fn test_empty_cell() {
        let cell = ImageCell::empty();
        assert!(!cell.is_present());
        assert!(cell.snapshot().is_none());
    }
}

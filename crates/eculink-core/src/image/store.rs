//! Configuration image persistence
//!
//! Connect-time sync caches the last known device configuration so a
//! reconnect with a matching checksum can skip the full read. How and where
//! the cache lives is the embedder's choice; [`FileImageStore`] covers the
//! common flat-file case. Persistence failures are never allowed to fail a
//! connection.

use std::fs;
use std::io;
use std::path::PathBuf;

use super::ConfigurationImage;

/// Storage collaborator for the configuration image
pub trait ImageStore: Send + Sync {
    /// Load the cached image, if one exists
    fn load_cached(&self) -> io::Result<Option<ConfigurationImage>>;

    /// Persist `image` as the new cache
    fn save_cached(&self, image: &ConfigurationImage) -> io::Result<()>;

    /// Render `image` as a tune document for external tools.
    ///
    /// Rendering is an external collaborator's concern; the default does
    /// nothing.
    fn export_tune(&self, _image: &ConfigurationImage) -> io::Result<()> {
        Ok(())
    }
}

/// Store that never caches anything
pub struct NullImageStore;

impl ImageStore for NullImageStore {
    fn load_cached(&self) -> io::Result<Option<ConfigurationImage>> {
        Ok(None)
    }

    fn save_cached(&self, _image: &ConfigurationImage) -> io::Result<()> {
        Ok(())
    }
}

/// File-backed store keeping the raw image bytes in a single cache file
pub struct FileImageStore {
    path: PathBuf,
}

impl FileImageStore {
    /// Cache the image at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The cache file location
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl ImageStore for FileImageStore {
    fn load_cached(&self) -> io::Result<Option<ConfigurationImage>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(ConfigurationImage::from_bytes(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save_cached(&self, image: &ConfigurationImage) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, image.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cache_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path().join("config.bin"));

        assert!(store.load_cached().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path().join("cache").join("config.bin"));
        let image = ConfigurationImage::from_bytes(vec![1, 2, 3, 4, 5]);

        store.save_cached(&image).unwrap();
        let loaded = store.load_cached().unwrap().unwrap();

        assert_eq!(loaded, image);
    }

    #[test]
    fn test_save_overwrites_previous_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path().join("config.bin"));

        store
            .save_cached(&ConfigurationImage::from_bytes(vec![1; 10]))
            .unwrap();
        store
            .save_cached(&ConfigurationImage::from_bytes(vec![2; 4]))
            .unwrap();

        let loaded = store.load_cached().unwrap().unwrap();
        assert_eq!(loaded.as_bytes(), &[2, 2, 2, 2]);
    }
}

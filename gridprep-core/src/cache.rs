//! Filesystem-backed key-value cache.
//!
//! Cache semantics for the persisted statistics live here in one place: a
//! value is authoritative once written and never silently recomputed, and a
//! configured reference directory is consulted for reads but never written,
//! so a shared reference stays safe for concurrent readers.

use crate::errors::ProcResult;
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

/// A cache of small artifacts keyed by relative path.
#[derive(Debug, Clone)]
pub struct FsCache {
    base: PathBuf,
    reference: Option<PathBuf>,
}

impl FsCache {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            reference: None,
        }
    }

    /// Read keys from `reference` instead of the local base directory.
    pub fn with_reference(mut self, reference: Option<PathBuf>) -> Self {
        self.reference = reference;
        self
    }

    pub fn read_only(&self) -> bool {
        self.reference.is_some()
    }

    /// Directory keys resolve against: the reference when configured,
    /// otherwise the local base.
    fn root(&self) -> &Path {
        self.reference.as_deref().unwrap_or(&self.base)
    }

    /// Path a key resolves to for reads.
    pub fn resolve(&self, key: &str) -> PathBuf {
        self.root().join(key)
    }

    /// The resolved path, if a value has been persisted for `key`.
    pub fn find(&self, key: &str) -> Option<PathBuf> {
        let path = self.resolve(key);
        path.exists().then_some(path)
    }

    /// Local path for writing `key`, with parent directories created.
    pub fn write_path(&self, key: &str) -> ProcResult<PathBuf> {
        let path = self.base.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let path = self.find(key)?;
        debug!("Loading cached value from {}", path.display());
        fs::read_to_string(path).ok()
    }

    /// Persist `value` under `key`.
    ///
    /// A no-op when a reference directory is configured (the reference is
    /// never mutated) or when the key already holds a value (a written value
    /// is authoritative).
    pub fn put(&self, key: &str, value: &str) -> ProcResult<()> {
        if self.read_only() {
            debug!("Reference directory configured, not persisting {}", key);
            return Ok(());
        }
        if self.find(key).is_some() {
            debug!("{} already persisted, leaving in place", key);
            return Ok(());
        }
        let path = self.write_path(key)?;
        fs::write(path, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_none_for_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path());
        assert!(cache.get("normalisation.mean/tas").is_none());
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path());
        cache.put("normalisation.mean/tas", "1.5,0.5").unwrap();
        assert_eq!(
            cache.get("normalisation.mean/tas").as_deref(),
            Some("1.5,0.5")
        );
    }

    #[test]
    fn put_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path());
        cache.put("k", "first").unwrap();
        cache.put("k", "second").unwrap();
        assert_eq!(cache.get("k").as_deref(), Some("first"));
    }

    #[test]
    fn reference_directory_is_read_only() {
        let refdir = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        std::fs::write(refdir.path().join("k"), "shared").unwrap();

        let cache = FsCache::new(local.path()).with_reference(Some(refdir.path().to_path_buf()));
        assert_eq!(cache.get("k").as_deref(), Some("shared"));

        cache.put("other", "value").unwrap();
        assert!(!refdir.path().join("other").exists());
        assert!(!local.path().join("other").exists());
    }
}

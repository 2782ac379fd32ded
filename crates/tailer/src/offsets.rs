//! Persistent per-file byte offsets.
//!
//! A JSON object mapping absolute path to the byte position of the last
//! fully-read line. Load failure (missing or corrupt file) yields an
//! empty map; saving is a whole-file temp-then-rename rewrite.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::TailerError;

#[derive(Debug)]
pub struct OffsetStore {
    path: PathBuf,
    offsets: BTreeMap<String, u64>,
}

impl OffsetStore {
    pub fn load(path: PathBuf) -> OffsetStore {
        let offsets = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        OffsetStore { path, offsets }
    }

    pub fn get(&self, file: &str) -> u64 {
        self.offsets.get(file).copied().unwrap_or(0)
    }

    pub fn set(&mut self, file: &str, offset: u64) {
        self.offsets.insert(file.to_string(), offset);
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Drop entries whose files no longer exist. Returns how many were
    /// removed.
    pub fn prune_missing(&mut self) -> usize {
        let before = self.offsets.len();
        self.offsets.retain(|path, _| Path::new(path).exists());
        before - self.offsets.len()
    }

    pub fn save(&self) -> Result<(), TailerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&self.offsets)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_empty() {
        let dir = tempdir().unwrap();
        let store = OffsetStore::load(dir.path().join("offsets.json"));
        assert!(store.is_empty());
        assert_eq!(store.get("/var/log/syslog"), 0);
    }

    #[test]
    fn test_corrupt_file_yields_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        fs::write(&path, "not json at all").unwrap();
        let store = OffsetStore::load(path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("offsets.json");

        let mut store = OffsetStore::load(path.clone());
        store.set("/var/log/kern.log", 4096);
        store.set("/var/log/syslog", 128);
        store.save().unwrap();

        let reloaded = OffsetStore::load(path);
        assert_eq!(reloaded.get("/var/log/kern.log"), 4096);
        assert_eq!(reloaded.get("/var/log/syslog"), 128);
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_prune_missing() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("live.log");
        fs::write(&live, "x").unwrap();

        let mut store = OffsetStore::load(dir.path().join("offsets.json"));
        store.set(live.to_str().unwrap(), 1);
        store.set("/nonexistent/rotated.log", 999);

        assert_eq!(store.prune_missing(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(live.to_str().unwrap()), 1);
    }
}

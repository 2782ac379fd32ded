//! Append-only NDJSON event store.
//!
//! One JSON object per line in `data/anomalies.ndjson`, with per-day
//! copies under `data/anomalies/YYYY-MM-DD.ndjson`. Appends go through
//! `O_APPEND` handles serialized by a store mutex; the retention rewrite
//! holds the same mutex so readers see either the old or the new file,
//! never a partial rewrite. Streaming reads re-open the file per query
//! and tolerate torn lines.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use kwatch_core::Event;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

pub const EVENTS_FILE: &str = "anomalies.ndjson";
pub const DAY_DIR: &str = "anomalies";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct EventStore {
    data_dir: PathBuf,
    /// Serializes appends against the GC rewrite.
    write_lock: Mutex<()>,
}

impl EventStore {
    pub fn open(data_dir: PathBuf) -> Result<EventStore, StoreError> {
        fs::create_dir_all(&data_dir)?;
        let store = EventStore {
            data_dir,
            write_lock: Mutex::new(()),
        };
        // The tail-follower needs the file to exist before any append.
        if !store.events_path().exists() {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(store.events_path())?;
        }
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn events_path(&self) -> PathBuf {
        self.data_dir.join(EVENTS_FILE)
    }

    pub fn day_dir(&self) -> PathBuf {
        self.data_dir.join(DAY_DIR)
    }

    /// Append one event to the main log and its day partition.
    pub fn append(&self, event: &Event) -> Result<(), StoreError> {
        let line = serde_json::to_string(event)?;
        let _guard = self.write_lock.lock();

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())?;
        writeln!(f, "{}", line)?;

        // Day partition keyed by the event's own detection date.
        if let Some(date) = event.detected_at.get(..10) {
            let day_dir = self.day_dir();
            fs::create_dir_all(&day_dir)?;
            let mut day = OpenOptions::new()
                .create(true)
                .append(true)
                .open(day_dir.join(format!("{}.ndjson", date)))?;
            writeln!(day, "{}", line)?;
        }
        Ok(())
    }

    /// Stream every parseable event. Unparseable lines (torn writes) are
    /// skipped silently; a missing file yields an empty iterator.
    pub fn iter(&self) -> impl Iterator<Item = Event> {
        let lines = File::open(self.events_path())
            .map(|f| BufReader::new(f).lines())
            .ok();
        lines
            .into_iter()
            .flatten()
            .filter_map(|l| l.ok())
            .filter_map(|l| serde_json::from_str::<Event>(&l).ok())
    }

    /// Raw-line variant for consumers that must keep unknown fields
    /// intact (the retention rewrite).
    pub fn iter_raw(&self) -> impl Iterator<Item = (Value, String)> {
        let lines = File::open(self.events_path())
            .map(|f| BufReader::new(f).lines())
            .ok();
        lines
            .into_iter()
            .flatten()
            .filter_map(|l| l.ok())
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<Value>(&l).ok().map(|v| (v, l)))
    }

    pub fn count(&self) -> u64 {
        self.iter_raw().count() as u64
    }

    pub fn find(&self, id: &str) -> Option<Event> {
        self.iter().find(|ev| ev.id == id)
    }

    /// Distinct host ids, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .iter()
            .map(|ev| ev.host_id)
            .filter(|h| !h.is_empty())
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    /// Replace the whole log with `lines`, atomically (temp file +
    /// rename under the append lock). Used only by retention GC.
    pub fn rewrite(&self, lines: &[String]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let tmp = self.data_dir.join(format!(".{}.tmp", EVENTS_FILE));
        {
            let mut f = File::create(&tmp)?;
            for line in lines {
                writeln!(f, "{}", line)?;
            }
            f.sync_all()?;
        }
        fs::rename(&tmp, self.events_path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwatch_core::AnomalyType;
    use tempfile::tempdir;

    fn event(id_seed: u64, detected_at: &str) -> Event {
        Event::from_detection(
            AnomalyType::Oom,
            &format!("Out of memory: Killed process {}", id_seed),
            "/var/log/kern.log",
            id_seed,
            detected_at,
            "host-a",
        )
    }

    #[test]
    fn test_append_and_iter() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path().to_path_buf()).unwrap();
        store.append(&event(1, "2026-01-01T00:00:00Z")).unwrap();
        store.append(&event(2, "2026-01-01T00:00:01Z")).unwrap();

        let events: Vec<Event> = store.iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_day_partition_written() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path().to_path_buf()).unwrap();
        store.append(&event(1, "2026-03-04T12:00:00Z")).unwrap();

        let day_file = store.day_dir().join("2026-03-04.ndjson");
        assert!(day_file.exists());
        let content = fs::read_to_string(day_file).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn test_torn_lines_skipped() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path().to_path_buf()).unwrap();
        store.append(&event(1, "2026-01-01T00:00:00Z")).unwrap();
        // A torn write and an empty line.
        let mut f = OpenOptions::new()
            .append(true)
            .open(store.events_path())
            .unwrap();
        writeln!(f, "{{\"id\": \"trunc").unwrap();
        writeln!(f).unwrap();
        store.append(&event(2, "2026-01-01T00:00:01Z")).unwrap();

        assert_eq!(store.iter().count(), 2);
    }

    #[test]
    fn test_find_and_hosts() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path().to_path_buf()).unwrap();
        let ev = event(7, "2026-01-01T00:00:00Z");
        store.append(&ev).unwrap();

        assert_eq!(store.find(&ev.id).unwrap().id, ev.id);
        assert!(store.find("ffffffffffffffff").is_none());
        assert_eq!(store.hosts(), vec!["host-a".to_string()]);
    }

    #[test]
    fn test_rewrite_replaces_content() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path().to_path_buf()).unwrap();
        for i in 0..5 {
            store
                .append(&event(i, &format!("2026-01-01T00:00:0{}Z", i)))
                .unwrap();
        }
        let keep: Vec<String> = store
            .iter_raw()
            .skip(3)
            .map(|(_, line)| line)
            .collect();
        store.rewrite(&keep).unwrap();
        assert_eq!(store.count(), 2);
    }
}

//! Retention garbage collection.
//!
//! Prunes the event store by age and by count cap, removes expired
//! day-partition files, and drops offset entries for vanished files.
//! Runs on a periodic loop plus on demand when the scan loop observes
//! the store over its cap.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use kwatch_core::{parse_ts, Config};
use kwatch_tailer::OffsetStore;

use crate::app::App;
use crate::store::{EventStore, StoreError};

/// Cadence of the background pass.
pub const GC_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Default, PartialEq, Eq)]
pub struct GcOutcome {
    pub kept: usize,
    pub dropped: usize,
    pub day_files_removed: usize,
    pub offsets_pruned: usize,
}

/// One full GC pass against the store.
///
/// Events whose `detected_at` is missing or unparseable are retained by
/// age (sorted to the front) and remain subject to the count cap.
pub fn run_gc(
    store: &EventStore,
    config: &Config,
    offsets_path: Option<&std::path::Path>,
) -> Result<GcOutcome, StoreError> {
    let retention_days = config.detection.retention_days as i64;
    let max_events = config.detection.retention_max_events as usize;
    let cutoff = chrono::Utc::now().timestamp() - retention_days * 86_400;

    let mut keep: Vec<(i64, String)> = Vec::new();
    let mut dropped = 0usize;
    for (value, line) in store.iter_raw() {
        let epoch = value
            .get("detected_at")
            .and_then(|v| v.as_str())
            .and_then(parse_ts);
        match epoch {
            Some(e) if e < cutoff => dropped += 1,
            Some(e) => keep.push((e, line)),
            // Unparseable timestamps survive the age check.
            None => keep.push((0, line)),
        }
    }

    keep.sort_by_key(|(epoch, _)| *epoch);
    if max_events > 0 && keep.len() > max_events {
        let excess = keep.len() - max_events;
        keep.drain(..excess);
        dropped += excess;
    }

    let lines: Vec<String> = keep.iter().map(|(_, l)| l.clone()).collect();
    store.rewrite(&lines)?;

    let day_files_removed = prune_day_files(store, cutoff);
    let offsets_pruned = match offsets_path {
        Some(path) => {
            let mut offsets = OffsetStore::load(path.to_path_buf());
            let pruned = offsets.prune_missing();
            if pruned > 0 {
                if let Err(err) = offsets.save() {
                    tracing::warn!(%err, "failed to save pruned offsets");
                }
            }
            pruned
        }
        None => 0,
    };

    Ok(GcOutcome {
        kept: lines.len(),
        dropped,
        day_files_removed,
        offsets_pruned,
    })
}

/// Delete day-partition files whose date falls entirely before the cutoff.
fn prune_day_files(store: &EventStore, cutoff: i64) -> usize {
    let mut removed = 0;
    let Ok(entries) = fs::read_dir(store.day_dir()) else {
        return 0;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(base) = name.strip_suffix(".ndjson") else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(base, "%Y-%m-%d") else {
            continue;
        };
        let day_epoch = date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        if day_epoch < cutoff {
            if fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    removed
}

/// Background loop: one pass every [`GC_INTERVAL`], re-reading config
/// each time. Failures are logged and retried next pass.
pub async fn cleanup_loop(app: Arc<App>) {
    if app.cleanup_started.swap(true, std::sync::atomic::Ordering::SeqCst) {
        return;
    }
    loop {
        let config = app.config.snapshot();
        match app.gc_once(&config).await {
            Ok(outcome) => {
                tracing::info!(
                    kept = outcome.kept,
                    dropped = outcome.dropped,
                    day_files = outcome.day_files_removed,
                    "retention pass complete"
                );
            }
            Err(err) => tracing::warn!(%err, "retention pass failed"),
        }
        tokio::time::sleep(GC_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwatch_core::{AnomalyType, Event};
    use tempfile::tempdir;

    fn event_at(i: u64, ts: &str) -> Event {
        Event::from_detection(
            AnomalyType::Oom,
            &format!("Out of memory {}", i),
            "/var/log/kern.log",
            i,
            ts,
            "host-a",
        )
    }

    #[test]
    fn test_count_cap_keeps_newest() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path().to_path_buf()).unwrap();
        let now = chrono::Utc::now().timestamp();
        let mut ids = Vec::new();
        for i in 0..5 {
            let ts = chrono::DateTime::from_timestamp(now - 100 + i as i64, 0)
                .unwrap()
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string();
            let ev = event_at(i, &ts);
            ids.push(ev.id.clone());
            store.append(&ev).unwrap();
        }

        let mut config = Config::default();
        config.detection.retention_max_events = 3;
        let outcome = run_gc(&store, &config, None).unwrap();
        assert_eq!(outcome.kept, 3);
        assert_eq!(outcome.dropped, 2);

        let remaining: Vec<String> = store.iter().map(|e| e.id).collect();
        assert_eq!(remaining, ids[2..].to_vec(), "exactly the last three");
    }

    #[test]
    fn test_age_cutoff_drops_old_events() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path().to_path_buf()).unwrap();
        store.append(&event_at(1, "2000-01-01T00:00:00Z")).unwrap();
        let fresh = kwatch_core::now_ts();
        store.append(&event_at(2, &fresh)).unwrap();

        let config = Config::default();
        let outcome = run_gc(&store, &config, None).unwrap();
        assert_eq!(outcome.kept, 1);
        let kept: Vec<Event> = store.iter().collect();
        assert_eq!(kept[0].detected_at, fresh);
        let cutoff = chrono::Utc::now().timestamp()
            - config.detection.retention_days as i64 * 86_400;
        assert!(parse_ts(&kept[0].detected_at).unwrap() >= cutoff);
    }

    #[test]
    fn test_unparseable_timestamps_survive_age_check() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path().to_path_buf()).unwrap();
        std::fs::write(
            store.events_path(),
            "{\"id\":\"aaaa\",\"detected_at\":\"garbage\"}\n",
        )
        .unwrap();

        let outcome = run_gc(&store, &Config::default(), None).unwrap();
        assert_eq!(outcome.kept, 1);
    }

    #[test]
    fn test_expired_day_partitions_removed() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path().to_path_buf()).unwrap();
        let day_dir = store.day_dir();
        fs::create_dir_all(&day_dir).unwrap();
        fs::write(day_dir.join("2000-01-01.ndjson"), "{}\n").unwrap();
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        fs::write(day_dir.join(format!("{}.ndjson", today)), "{}\n").unwrap();
        fs::write(day_dir.join("notes.txt"), "keep me").unwrap();

        let outcome = run_gc(&store, &Config::default(), None).unwrap();
        assert_eq!(outcome.day_files_removed, 1);
        assert!(!day_dir.join("2000-01-01.ndjson").exists());
        assert!(day_dir.join(format!("{}.ndjson", today)).exists());
        assert!(day_dir.join("notes.txt").exists());
    }

    #[test]
    fn test_stale_offsets_pruned() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path().to_path_buf()).unwrap();
        let offsets_path = dir.path().join("ingest_offsets.json");
        let mut offsets = OffsetStore::load(offsets_path.clone());
        offsets.set("/nonexistent/gone.log", 123);
        offsets.save().unwrap();

        let outcome = run_gc(&store, &Config::default(), Some(offsets_path.as_path())).unwrap();
        assert_eq!(outcome.offsets_pruned, 1);
        let reloaded = OffsetStore::load(offsets_path);
        assert!(reloaded.is_empty());
    }
}

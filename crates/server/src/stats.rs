//! Rolling statistics over the event store.
//!
//! Computed on demand by a single streaming scan; never a source of
//! truth. Linear cost is acceptable under the retention cap.

use std::collections::BTreeMap;

use kwatch_core::{parse_ts, Severity, SCHEMA_VERSION};
use serde::Serialize;

use crate::store::EventStore;

#[derive(Debug, Serialize)]
pub struct Summary {
    pub schema_version: String,
    pub total_anomalies: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub by_host: BTreeMap<String, u64>,
    pub hosts: Vec<String>,
    pub last_detection: Option<String>,
    pub last_scan: String,
}

/// Parse the stats window grammar: `PT<H>H` or `<H>h`, interpreted as
/// "the last H hours". Anything else means no window.
pub fn parse_window(window: &str) -> Option<i64> {
    let hours: &str = if let Some(rest) = window.strip_prefix("PT") {
        rest.strip_suffix('H')?
    } else {
        window.strip_suffix('h')?
    };
    let h: i64 = hours.parse().ok()?;
    Some(h.checked_mul(3600)?)
}

/// One pass over the store, counting by severity, type, and host.
/// Severity buckets are always present, zero-filled.
pub fn compute_stats(
    store: &EventStore,
    window: Option<&str>,
    host_id: Option<&str>,
    last_scan: Option<String>,
) -> Summary {
    let window_sec = window.and_then(parse_window);
    let now = chrono::Utc::now().timestamp();

    let mut by_severity: BTreeMap<String, u64> = BTreeMap::new();
    for sev in [Severity::Critical, Severity::Major, Severity::Minor] {
        by_severity.insert(sev.as_str().to_string(), 0);
    }
    let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_host: BTreeMap<String, u64> = BTreeMap::new();
    let mut total = 0;
    let mut last_detection: Option<String> = None;

    for ev in store.iter() {
        if let Some(h) = host_id {
            if ev.host_id != h {
                continue;
            }
        }
        if let Some(window_sec) = window_sec {
            // Events with unparseable timestamps stay in scope.
            if let Some(epoch) = parse_ts(&ev.detected_at) {
                if now - epoch > window_sec {
                    continue;
                }
            }
        }

        total += 1;
        *by_severity
            .entry(ev.severity.as_str().to_string())
            .or_insert(0) += 1;
        *by_type
            .entry(ev.anomaly_type.as_str().to_string())
            .or_insert(0) += 1;
        if !ev.host_id.is_empty() {
            *by_host.entry(ev.host_id.clone()).or_insert(0) += 1;
        }
        if last_detection
            .as_deref()
            .map(|cur| ev.detected_at.as_str() > cur)
            .unwrap_or(true)
        {
            last_detection = Some(ev.detected_at.clone());
        }
    }

    let hosts: Vec<String> = by_host.keys().cloned().collect();
    Summary {
        schema_version: SCHEMA_VERSION.to_string(),
        total_anomalies: total,
        by_severity,
        by_type,
        by_host,
        hosts,
        last_detection,
        last_scan: last_scan.unwrap_or_else(kwatch_core::now_ts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwatch_core::{AnomalyType, Event};
    use tempfile::tempdir;

    fn store_with(events: &[(AnomalyType, &str, &str)]) -> (tempfile::TempDir, EventStore) {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path().to_path_buf()).unwrap();
        for (i, (t, host, ts)) in events.iter().enumerate() {
            let ev = Event::from_detection(*t, &format!("msg {}", i), "/var/log/x.log", i as u64, ts, host);
            store.append(&ev).unwrap();
        }
        (dir, store)
    }

    #[test]
    fn test_window_grammar() {
        assert_eq!(parse_window("PT24H"), Some(86400));
        assert_eq!(parse_window("24h"), Some(86400));
        assert_eq!(parse_window("1h"), Some(3600));
        assert_eq!(parse_window("PTxH"), None);
        assert_eq!(parse_window("soon"), None);
    }

    #[test]
    fn test_counts_and_zero_fill() {
        let (_dir, store) = store_with(&[
            (AnomalyType::KernelPanic, "a", "2026-01-01T00:00:00Z"),
            (AnomalyType::Oom, "a", "2026-01-01T00:00:01Z"),
            (AnomalyType::Oom, "b", "2026-01-01T00:00:02Z"),
        ]);
        let s = compute_stats(&store, None, None, None);
        assert_eq!(s.total_anomalies, 3);
        assert_eq!(s.by_severity["critical"], 1);
        assert_eq!(s.by_severity["major"], 2);
        assert_eq!(s.by_severity["minor"], 0, "zero-filled even when empty");
        assert_eq!(s.by_type["oom"], 2);
        assert_eq!(s.by_host["a"], 2);
        assert_eq!(s.hosts, vec!["a", "b"]);
        assert_eq!(s.last_detection.as_deref(), Some("2026-01-01T00:00:02Z"));
    }

    #[test]
    fn test_host_filter() {
        let (_dir, store) = store_with(&[
            (AnomalyType::Oom, "a", "2026-01-01T00:00:00Z"),
            (AnomalyType::Oom, "b", "2026-01-01T00:00:01Z"),
        ]);
        let s = compute_stats(&store, None, Some("b"), None);
        assert_eq!(s.total_anomalies, 1);
        assert_eq!(s.by_host.get("a"), None);
    }

    #[test]
    fn test_window_excludes_old_events() {
        let recent = kwatch_core::now_ts();
        let (_dir, store) = store_with(&[
            (AnomalyType::Oom, "a", "2000-01-01T00:00:00Z"),
            (AnomalyType::Oom, "a", recent.leak()),
        ]);
        let s = compute_stats(&store, Some("PT24H"), None, None);
        assert_eq!(s.total_anomalies, 1);

        let all = compute_stats(&store, None, None, None);
        assert_eq!(all.total_anomalies, 2);
    }

    #[test]
    fn test_stats_partition_sums_to_total() {
        let (_dir, store) = store_with(&[
            (AnomalyType::KernelPanic, "a", "2026-01-01T00:00:00Z"),
            (AnomalyType::Oops, "b", "2026-01-02T00:00:00Z"),
            (AnomalyType::Deadlock, "a", "2026-01-03T00:00:00Z"),
        ]);
        let all = compute_stats(&store, None, None, None);
        let a = compute_stats(&store, None, Some("a"), None);
        let b = compute_stats(&store, None, Some("b"), None);
        assert_eq!(all.total_anomalies, a.total_anomalies + b.total_anomalies);
    }
}

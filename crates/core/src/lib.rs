//! kernelwatch core library
//!
//! Shared building blocks for the agent and server: the canonical Event
//! model, the kernel-fault classifier, and the configuration document
//! with its change watcher.

pub mod classify;
pub mod config;
pub mod error;
pub mod event;

pub use classify::{DetectionMode, DetectorSet};
pub use config::{Config, ConfigStore};
pub use error::CoreError;
pub use event::{event_id, AnomalyType, Event, Severity, SCHEMA_VERSION};

/// UTC timestamp in the wire format used everywhere in the pipeline
/// (`YYYY-MM-DDTHH:MM:SSZ`, second resolution).
pub fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Parse a wire-format timestamp back to epoch seconds.
pub fn parse_ts(s: &str) -> Option<i64> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Hostname of the local machine, used as `host_id` on emitted events.
pub fn local_host_id() -> String {
    std::env::var("KWATCH_HOST_ID")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_round_trip() {
        let ts = now_ts();
        assert!(parse_ts(&ts).is_some());
        assert_eq!(parse_ts("2026-01-02T03:04:05Z"), Some(1767323045));
    }

    #[test]
    fn test_parse_ts_rejects_garbage() {
        assert_eq!(parse_ts("not-a-date"), None);
        assert_eq!(parse_ts(""), None);
    }
}

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Wire schema version stamped on every persisted event.
pub const SCHEMA_VERSION: &str = "1.0";

/// The six kernel fault categories the pipeline recognizes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Oom,
    KernelPanic,
    UnexpectedReboot,
    FsError,
    Oops,
    Deadlock,
}

impl AnomalyType {
    pub const ALL: [AnomalyType; 6] = [
        AnomalyType::Oom,
        AnomalyType::KernelPanic,
        AnomalyType::UnexpectedReboot,
        AnomalyType::FsError,
        AnomalyType::Oops,
        AnomalyType::Deadlock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::Oom => "oom",
            AnomalyType::KernelPanic => "kernel_panic",
            AnomalyType::UnexpectedReboot => "unexpected_reboot",
            AnomalyType::FsError => "fs_error",
            AnomalyType::Oops => "oops",
            AnomalyType::Deadlock => "deadlock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "oom" => Some(AnomalyType::Oom),
            "kernel_panic" => Some(AnomalyType::KernelPanic),
            "unexpected_reboot" => Some(AnomalyType::UnexpectedReboot),
            "fs_error" => Some(AnomalyType::FsError),
            "oops" => Some(AnomalyType::Oops),
            "deadlock" => Some(AnomalyType::Deadlock),
            _ => None,
        }
    }

    /// Severity is a pure function of the anomaly type.
    pub fn severity(&self) -> Severity {
        match self {
            AnomalyType::KernelPanic => Severity::Critical,
            AnomalyType::Oom
            | AnomalyType::UnexpectedReboot
            | AnomalyType::FsError
            | AnomalyType::Deadlock => Severity::Major,
            AnomalyType::Oops => Severity::Minor,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Major => "major",
            Severity::Minor => "minor",
        }
    }
}

/// A single classified log line with structured metadata. Immutable once
/// written; identity is the `id` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub schema_version: String,

    /// First 16 hex chars of SHA-256 over host+source+line+timestamp+message.
    pub id: String,

    #[serde(rename = "type")]
    pub anomaly_type: AnomalyType,
    pub severity: Severity,

    /// Raw log line, trimmed.
    pub message: String,

    /// Absolute path, or a symbolic source such as `journalctl`.
    pub source_file: String,

    /// 1-based within the scan pass that produced the event; 0 when the
    /// source is not line-addressable.
    pub line_number: u64,

    /// `YYYY-MM-DDTHH:MM:SSZ` UTC.
    pub detected_at: String,

    /// Hostname of the originating machine.
    pub host_id: String,

    /// Reserved processing flag.
    #[serde(default)]
    pub processed: bool,
}

impl Event {
    /// Build a fully-populated event from a classified line, deriving the
    /// id, severity, and schema version.
    pub fn from_detection(
        anomaly_type: AnomalyType,
        message: &str,
        source_file: &str,
        line_number: u64,
        detected_at: &str,
        host_id: &str,
    ) -> Self {
        let message = message.trim().to_string();
        let id = event_id(host_id, source_file, line_number, detected_at, &message);
        Event {
            schema_version: SCHEMA_VERSION.to_string(),
            id,
            anomaly_type,
            severity: anomaly_type.severity(),
            message,
            source_file: source_file.to_string(),
            line_number,
            detected_at: detected_at.to_string(),
            host_id: host_id.to_string(),
            processed: false,
        }
    }
}

/// Deterministic event identity: first 16 hex chars of SHA-256 over the
/// concatenated identity fields.
pub fn event_id(
    host_id: &str,
    source_file: &str,
    line_number: u64,
    detected_at: &str,
    message: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host_id.as_bytes());
    hasher.update(source_file.as_bytes());
    hasher.update(line_number.to_string().as_bytes());
    hasher.update(detected_at.as_bytes());
    hasher.update(message.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_table() {
        assert_eq!(AnomalyType::KernelPanic.severity(), Severity::Critical);
        assert_eq!(AnomalyType::Oom.severity(), Severity::Major);
        assert_eq!(AnomalyType::UnexpectedReboot.severity(), Severity::Major);
        assert_eq!(AnomalyType::FsError.severity(), Severity::Major);
        assert_eq!(AnomalyType::Deadlock.severity(), Severity::Major);
        assert_eq!(AnomalyType::Oops.severity(), Severity::Minor);
    }

    #[test]
    fn test_event_id_deterministic() {
        let a = event_id("host-a", "/var/log/kern.log", 42, "2026-01-01T00:00:00Z", "oops");
        let b = event_id("host-a", "/var/log/kern.log", 42, "2026-01-01T00:00:00Z", "oops");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_event_id_sensitive_to_fields() {
        let base = event_id("h", "f", 1, "2026-01-01T00:00:00Z", "m");
        assert_ne!(base, event_id("h2", "f", 1, "2026-01-01T00:00:00Z", "m"));
        assert_ne!(base, event_id("h", "f2", 1, "2026-01-01T00:00:00Z", "m"));
        assert_ne!(base, event_id("h", "f", 2, "2026-01-01T00:00:00Z", "m"));
        assert_ne!(base, event_id("h", "f", 1, "2026-01-01T00:00:01Z", "m"));
        assert_ne!(base, event_id("h", "f", 1, "2026-01-01T00:00:00Z", "m2"));
    }

    #[test]
    fn test_event_serde_wire_names() {
        let ev = Event::from_detection(
            AnomalyType::KernelPanic,
            "Kernel panic - not syncing: Fatal exception",
            "/var/log/kern.log",
            7,
            "2026-01-01T00:00:00Z",
            "node-1",
        );
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "kernel_panic");
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["schema_version"], "1.0");
        assert_eq!(json["processed"], false);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, ev.id);
        assert_eq!(back.anomaly_type, AnomalyType::KernelPanic);
    }

    #[test]
    fn test_message_trimmed() {
        let ev = Event::from_detection(
            AnomalyType::Oom,
            "  Out of memory: Killed process 1234 (a.out)\n",
            "/var/log/syslog",
            1,
            "2026-01-01T00:00:00Z",
            "node-1",
        );
        assert_eq!(ev.message, "Out of memory: Killed process 1234 (a.out)");
    }
}

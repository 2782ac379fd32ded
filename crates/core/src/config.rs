//! Whole-document JSON configuration.
//!
//! The document is read-through (every consumer loads a snapshot) and
//! mutated only by atomic whole-file rewrite. A [`ConfigStore`] owns the
//! file path and a watch channel so long-running loops can react to
//! mutation without polling file mtimes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::classify::DetectionMode;
use crate::error::CoreError;
use crate::event::SCHEMA_VERSION;

/// Per-detector configuration override, extending the built-in tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorOverride {
    pub enabled: bool,
    pub keywords: Vec<String>,
    pub regex_patterns: Vec<String>,
    pub detection_mode: Option<DetectionMode>,
}

impl Default for DetectorOverride {
    fn default() -> Self {
        DetectorOverride {
            enabled: true,
            keywords: Vec::new(),
            regex_patterns: Vec::new(),
            detection_mode: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    pub log_paths: Vec<String>,
    pub scan_interval_sec: u64,
    pub retention_days: u32,
    pub retention_max_events: u64,
    pub enabled_detectors: Vec<String>,
    pub search_mode: DetectionMode,
    /// When false the server only accepts agent reports and runs no
    /// local scan loop.
    pub local_detection_enabled: bool,
    /// Optional per-type keyword/regex extensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detectors: Option<BTreeMap<String, DetectorOverride>>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            log_paths: vec!["/var/log".to_string()],
            scan_interval_sec: 60,
            retention_days: 30,
            retention_max_events: 50_000,
            enabled_detectors: vec![
                "oom".to_string(),
                "kernel_panic".to_string(),
                "unexpected_reboot".to_string(),
                "fs_error".to_string(),
                "oops".to_string(),
                "deadlock".to_string(),
            ],
            search_mode: DetectionMode::Mixed,
            local_detection_enabled: true,
            detectors: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub emails: Vec<String>,
    pub notify_critical: bool,
    pub silent_minutes: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        AlertsConfig {
            enabled: false,
            emails: Vec::new(),
            notify_critical: true,
            silent_minutes: 30,
        }
    }
}

/// SMTP transport settings. Any empty field falls back to the matching
/// `SMTP_*` environment variable at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub from: String,
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared secret for `POST /api/v1/ingest`. Empty disables the gate.
    pub ingest_token: String,
    pub sse_max_clients: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            ingest_token: String::new(),
            sse_max_clients: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UiConfig {
    pub auto_refresh_sec: u64,
    pub page_size: usize,
    pub time_format: String,
}

impl Default for UiConfig {
    fn default() -> Self {
        UiConfig {
            auto_refresh_sec: 30,
            page_size: 20,
            time_format: "24h".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// When true the agent saves offsets only after the server
    /// acknowledges the batch (strict at-least-once delivery).
    pub commit_after_ack: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            commit_after_ack: false,
        }
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub schema_version: String,
    pub detection: DetectionConfig,
    pub alerts: AlertsConfig,
    pub smtp: SmtpConfig,
    pub security: SecurityConfig,
    pub ui: UiConfig,
    pub agent: AgentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            schema_version: SCHEMA_VERSION.to_string(),
            detection: DetectionConfig::default(),
            alerts: AlertsConfig::default(),
            smtp: SmtpConfig::default(),
            security: SecurityConfig::default(),
            ui: UiConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

/// Top-level keys a replacement document may contain.
pub const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "schema_version",
    "detection",
    "alerts",
    "smtp",
    "security",
    "ui",
    "agent",
];

const EMAIL_RE: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";

impl Config {
    /// Load from a JSON file; a missing or unreadable file yields the
    /// defaults (the bootstrap path writes them back).
    pub fn load(path: &Path) -> Config {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "config unreadable, using defaults");
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    /// Validate the range and format constraints a replacement document
    /// must satisfy. Returns the offending parameter name on failure.
    pub fn validate(&self) -> Result<(), String> {
        let d = &self.detection;
        if !(5..=3600).contains(&d.scan_interval_sec) {
            return Err("scan_interval_sec".to_string());
        }
        if !(1..=365).contains(&d.retention_days) {
            return Err("retention_days".to_string());
        }
        if !(1..=1_000_000).contains(&d.retention_max_events) {
            return Err("retention_max_events".to_string());
        }
        if let Some(first) = self.alerts.emails.first() {
            let re = regex::Regex::new(EMAIL_RE).expect("email regex");
            if !re.is_match(first) {
                return Err("alerts.emails".to_string());
            }
        }
        Ok(())
    }

    /// Scan interval clamped to the accepted range, as the loops consume it.
    pub fn scan_interval(&self) -> u64 {
        self.detection.scan_interval_sec.clamp(5, 3600)
    }
}

/// Atomic whole-file write: temp file in the same directory then rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "config".to_string())
    ));
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Owns the config file path and broadcasts change notifications.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    tx: watch::Sender<Config>,
}

impl ConfigStore {
    /// Open the store, writing the default document if none exists yet.
    pub fn open(path: PathBuf) -> Result<ConfigStore, CoreError> {
        if !path.exists() {
            write_json_atomic(&path, &Config::default())?;
        }
        let current = Config::load(&path);
        let (tx, _) = watch::channel(current);
        Ok(ConfigStore { path, tx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot. Reads the file so out-of-band edits are seen.
    pub fn snapshot(&self) -> Config {
        Config::load(&self.path)
    }

    /// Replace the stored document and notify watchers.
    pub fn replace(&self, cfg: &Config) -> Result<(), CoreError> {
        write_json_atomic(&self.path, cfg)?;
        self.tx.send_replace(cfg.clone());
        Ok(())
    }

    /// Subscribe for change notifications; the receiver's value is the
    /// config as of the last in-process mutation.
    pub fn watch(&self) -> watch::Receiver<Config> {
        self.tx.subscribe()
    }
}

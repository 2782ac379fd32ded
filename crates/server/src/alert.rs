//! Alert debouncing and SMTP dispatch.
//!
//! Alerts are keyed by a fingerprint of severity, type, and the first
//! 120 chars of the message. A fingerprint stays silent for
//! `alerts.silent_minutes` after a successful dispatch; critical events
//! bypass the window when `notify_critical` is set. State is persisted
//! only after a send succeeds, so a failed dispatch retries on the next
//! qualifying event.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use kwatch_core::{Config, Event, Severity};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ALERT_STATE_FILE: &str = "alert_state.json";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("smtp not configured")]
    NotConfigured,

    #[error("address: {0}")]
    Address(String),

    #[error("send: {0}")]
    Send(String),
}

/// Dispatch seam so tests substitute a recording transport.
pub trait MailTransport: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Effective SMTP settings: config values with `SMTP_*` env fallback.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub from: String,
    pub tls: bool,
}

impl SmtpSettings {
    pub fn resolve(config: &Config) -> SmtpSettings {
        let env = |key: &str| std::env::var(key).unwrap_or_default();
        let smtp = &config.smtp;
        let host = if smtp.host.is_empty() { env("SMTP_HOST") } else { smtp.host.clone() };
        let port = if smtp.port != 0 {
            smtp.port
        } else {
            env("SMTP_PORT").parse().unwrap_or(25)
        };
        let user = if smtp.user.is_empty() { env("SMTP_USER") } else { smtp.user.clone() };
        let pass = if smtp.pass.is_empty() { env("SMTP_PASS") } else { smtp.pass.clone() };
        let from = if smtp.from.is_empty() {
            let f = env("SMTP_FROM");
            if f.is_empty() {
                if user.is_empty() {
                    "noreply@example.com".to_string()
                } else {
                    user.clone()
                }
            } else {
                f
            }
        } else {
            smtp.from.clone()
        };
        let tls = smtp.tls || env("SMTP_TLS") == "1";
        SmtpSettings { host, port, user, pass, from, tls }
    }
}

/// Real SMTP dispatch via lettre, 10 s timeout.
pub struct SmtpMailer {
    settings: SmtpSettings,
}

impl SmtpMailer {
    pub fn new(settings: SmtpSettings) -> SmtpMailer {
        SmtpMailer { settings }
    }
}

impl MailTransport for SmtpMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let s = &self.settings;
        if s.host.is_empty() {
            return Err(MailError::NotConfigured);
        }
        let from: Mailbox = s
            .from
            .parse()
            .map_err(|e| MailError::Address(format!("from: {}", e)))?;
        let to: Mailbox = to
            .parse()
            .map_err(|e| MailError::Address(format!("to: {}", e)))?;
        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| MailError::Send(e.to_string()))?;

        let mut builder = if s.tls {
            SmtpTransport::starttls_relay(&s.host).map_err(|e| MailError::Send(e.to_string()))?
        } else {
            SmtpTransport::builder_dangerous(&s.host)
        };
        builder = builder.port(s.port).timeout(Some(Duration::from_secs(10)));
        if !s.user.is_empty() {
            builder = builder.credentials(Credentials::new(s.user.clone(), s.pass.clone()));
        }
        let transport = builder.build();
        transport
            .send(&message)
            .map(|_| ())
            .map_err(|e| MailError::Send(e.to_string()))
    }
}

/// Fingerprint for debounce: sha256 over `severity|type|message[:120]`.
pub fn fingerprint(event: &Event) -> String {
    let msg: String = event.message.chars().take(120).collect();
    let raw = format!(
        "{}|{}|{}",
        event.severity.as_str(),
        event.anomaly_type.as_str(),
        msg
    );
    let digest = Sha256::digest(raw.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Why an event did not produce a dispatch.
#[derive(Debug, PartialEq, Eq)]
pub enum AlertDecision {
    Sent,
    Disabled,
    NoRecipient,
    Suppressed,
    SendFailed,
}

/// Fingerprint-keyed last-sent state with a pluggable transport.
pub struct AlertDebouncer {
    state_path: PathBuf,
    state: Mutex<HashMap<String, f64>>,
    transport: Box<dyn MailTransport>,
}

impl AlertDebouncer {
    pub fn new(state_path: PathBuf, transport: Box<dyn MailTransport>) -> AlertDebouncer {
        let state = std::fs::read_to_string(&state_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        AlertDebouncer {
            state_path,
            state: Mutex::new(state),
            transport,
        }
    }

    /// Evaluate one event against the current config.
    pub fn evaluate(&self, event: &Event, config: &Config) -> AlertDecision {
        self.evaluate_at(event, config, now_epoch())
    }

    /// Clock-injected variant; the decision logic is pure given `now`.
    pub fn evaluate_at(&self, event: &Event, config: &Config, now: f64) -> AlertDecision {
        let alerts = &config.alerts;
        if !alerts.enabled {
            return AlertDecision::Disabled;
        }
        let Some(to) = alerts.emails.first() else {
            return AlertDecision::NoRecipient;
        };

        let key = fingerprint(event);
        let silent = alerts.silent_minutes as f64 * 60.0;
        let critical_bypass = event.severity == Severity::Critical && alerts.notify_critical;
        if !critical_bypass {
            let state = self.state.lock();
            if let Some(last) = state.get(&key) {
                if now - last < silent {
                    return AlertDecision::Suppressed;
                }
            }
        }

        let subject = format!(
            "[{}] {}",
            event.severity.as_str(),
            event.anomaly_type.as_str()
        );
        let body = format!(
            "Type: {}\nSeverity: {}\nDetected At: {}\nHost: {}\nSource: {}:{}\n\nMessage:\n{}\n",
            event.anomaly_type.as_str(),
            event.severity.as_str(),
            event.detected_at,
            event.host_id,
            event.source_file,
            event.line_number,
            event.message
        );

        match self.transport.send(to, &subject, &body) {
            Ok(()) => {
                let mut state = self.state.lock();
                state.insert(key, now);
                if let Err(err) = persist(&self.state_path, &state) {
                    tracing::warn!(%err, "failed to persist alert state");
                }
                AlertDecision::Sent
            }
            Err(err) => {
                tracing::warn!(%err, "alert dispatch failed");
                AlertDecision::SendFailed
            }
        }
    }
}

fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn persist(path: &PathBuf, state: &HashMap<String, f64>) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(state)?)?;
    std::fs::rename(&tmp, path)
}

//! Optional systemd journal drain.
//!
//! One-shot only: the journal is not offset-tracked, so only the agent's
//! full-scan path uses it. Events carry `source_file = "journalctl"` and
//! line number 0.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use crate::pass::{EventSink, Tailer};

pub const JOURNAL_SOURCE: &str = "journalctl";

/// Whether `journalctl` can be spawned on this host.
pub fn journal_available() -> bool {
    Command::new("journalctl")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Drain the journal sequentially through the classifier. Returns the
/// number of events emitted, or 0 with a warning if journalctl fails.
pub fn scan_journal(tailer: &Tailer, sink: &mut dyn EventSink) -> u64 {
    let child = Command::new("journalctl")
        .args(["-o", "short-iso", "--no-pager"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();

    let mut child = match child {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(%err, "failed to spawn journalctl");
            return 0;
        }
    };

    let mut emitted = 0;
    if let Some(stdout) = child.stdout.take() {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            emitted += tailer.classify_line(&line, JOURNAL_SOURCE, 0, sink);
        }
    }
    if let Err(err) = child.wait() {
        tracing::warn!(%err, "journalctl did not exit cleanly");
    }
    emitted
}

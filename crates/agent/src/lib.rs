//! Remote detection agent.
//!
//! Runs the tailer against local log files and reports classified
//! events to the central ingest server in batches. The inter-scan wait
//! is interruptible: the config file is re-read every second and a
//! change to the scanning snapshot restarts the loop early.

use std::path::PathBuf;
use std::time::Duration;

use kwatch_core::{local_host_id, Config, DetectionMode, DetectorSet, Event};
use kwatch_tailer::journal;
use kwatch_tailer::{OffsetStore, PassStats, Tailer};

pub const AGENT_OFFSETS_FILE: &str = "agent_offsets.json";

/// The config fields whose change interrupts the wait loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSnapshot {
    pub interval: u64,
    pub paths: Vec<String>,
    pub enabled: Vec<String>,
    pub mode: DetectionMode,
}

impl ScanSnapshot {
    pub fn of(config: &Config) -> ScanSnapshot {
        ScanSnapshot {
            interval: config.scan_interval(),
            paths: config.detection.log_paths.clone(),
            enabled: config.detection.enabled_detectors.clone(),
            mode: config.detection.search_mode,
        }
    }
}

pub struct Agent {
    server_url: String,
    token: Option<String>,
    config_path: PathBuf,
    data_dir: PathBuf,
    host_id: String,
    client: reqwest::Client,
}

impl Agent {
    pub fn new(
        server_url: &str,
        token: Option<String>,
        config_path: PathBuf,
        data_dir: PathBuf,
    ) -> anyhow::Result<Agent> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Agent {
            server_url: server_url.trim_end_matches('/').to_string(),
            token,
            config_path,
            data_dir,
            host_id: local_host_id(),
            client,
        })
    }

    pub fn load_config(&self) -> Config {
        Config::load(&self.config_path)
    }

    fn ingest_url(&self) -> String {
        format!("{}/api/v1/ingest", self.server_url)
    }

    fn build_tailer(&self, config: &Config) -> Tailer {
        let detectors = DetectorSet::build(
            &config.detection.enabled_detectors,
            config.detection.search_mode,
            config.detection.detectors.as_ref(),
        );
        let offsets = OffsetStore::load(self.data_dir.join(AGENT_OFFSETS_FILE));
        Tailer::new(detectors, self.host_id.clone(), offsets)
    }

    /// One incremental pass, collecting the batch to report. Offsets are
    /// committed eagerly unless `agent.commit_after_ack` defers them to
    /// a successful POST.
    pub async fn run_cycle(&self, config: &Config) -> anyhow::Result<PassStats> {
        let mut tailer = self.build_tailer(config);
        let mut batch: Vec<Event> = Vec::new();
        let stats = {
            let mut sink = |ev: Event| batch.push(ev);
            tailer.run_incremental(&config.detection.log_paths, &mut sink)
        };

        let commit_after_ack = config.agent.commit_after_ack;
        if !commit_after_ack {
            tailer.commit_offsets()?;
        }

        if !batch.is_empty() {
            self.report(&batch).await?;
        }
        if commit_after_ack {
            // Reached only when the report (if any) succeeded.
            tailer.commit_offsets()?;
        }
        Ok(stats)
    }

    /// One full scan without offsets: whole files, rotated archives, and
    /// the systemd journal when available.
    pub async fn run_oneshot(&self, config: &Config) -> anyhow::Result<PassStats> {
        let mut tailer = self.build_tailer(config);
        let mut batch: Vec<Event> = Vec::new();
        let stats = {
            let mut sink = |ev: Event| batch.push(ev);
            let mut stats = tailer.run_oneshot(&config.detection.log_paths, &mut sink);
            if journal::journal_available() {
                stats.events_emitted += journal::scan_journal(&tailer, &mut sink);
            }
            stats
        };
        if !batch.is_empty() {
            self.report(&batch).await?;
        }
        Ok(stats)
    }

    /// POST a batch to the ingest API. Network failures are errors for
    /// the caller to log; the next cycle retries naturally because
    /// offsets only advance past classified content.
    pub async fn report(&self, events: &[Event]) -> anyhow::Result<usize> {
        let mut request = self
            .client
            .post(self.ingest_url())
            .json(&serde_json::json!({ "events": events }));
        if let Some(token) = &self.token {
            request = request.header("X-Ingest-Token", token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("ingest rejected batch: HTTP {}", status);
        }
        let body: serde_json::Value = response.json().await?;
        let processed = body
            .get("processed")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        tracing::info!(
            received = events.len(),
            processed,
            "batch reported"
        );
        Ok(processed)
    }

    /// Main loop: scan, report, then wait in 1-second ticks, re-reading
    /// the config each tick and restarting early when the scanning
    /// snapshot changes.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!(
            host = %self.host_id,
            server = %self.server_url,
            "agent started"
        );
        loop {
            let config = self.load_config();
            let snapshot = ScanSnapshot::of(&config);

            match self.run_cycle(&config).await {
                Ok(stats) => tracing::info!(
                    files = stats.files_scanned,
                    events = stats.events_emitted,
                    "scan cycle complete"
                ),
                Err(err) => tracing::warn!(%err, "scan cycle failed, retrying next interval"),
            }

            let mut waited = 0;
            while waited < snapshot.interval {
                tokio::time::sleep(Duration::from_secs(1)).await;
                waited += 1;
                let current = ScanSnapshot::of(&self.load_config());
                if current != snapshot {
                    tracing::info!("config changed, restarting scan loop");
                    break;
                }
            }
        }
    }
}

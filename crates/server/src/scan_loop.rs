//! Server-local detection loop.
//!
//! Tails the configured log roots on the server host itself, feeding
//! classified events through the same persist/broadcast/alert path the
//! ingest API uses. The inter-pass wait is interruptible: a config
//! mutation wakes the loop immediately.

use std::sync::Arc;
use std::time::Duration;

use kwatch_core::{local_host_id, now_ts, DetectorSet, Event};
use kwatch_tailer::{OffsetStore, PassStats, Tailer};

use crate::app::App;

pub const INGEST_OFFSETS_FILE: &str = "ingest_offsets.json";

/// Singleton loop: one incremental pass per `scan_interval_sec`, with an
/// on-demand retention trigger when the store exceeds its cap.
pub async fn scan_loop(app: Arc<App>) {
    if app
        .scan_started
        .swap(true, std::sync::atomic::Ordering::SeqCst)
    {
        return;
    }
    let mut config_rx = app.config.watch();
    let host_id = local_host_id();

    loop {
        let config = app.config.snapshot();
        *app.last_scan.write() = Some(now_ts());

        let stats = run_pass(&app, &config, &host_id).await;
        tracing::info!(
            files = stats.files_scanned,
            lines = stats.lines_read,
            events = stats.events_emitted,
            "scan pass complete"
        );

        let cap = config.detection.retention_max_events;
        if cap > 0 && app.store.count() > cap {
            match app.gc_once(&config).await {
                Ok(outcome) => tracing::info!(
                    kept = outcome.kept,
                    dropped = outcome.dropped,
                    "store over cap, retention triggered"
                ),
                Err(err) => tracing::warn!(%err, "on-demand retention failed"),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(config.scan_interval())) => {}
            changed = config_rx.changed() => {
                if changed.is_ok() {
                    tracing::info!("config changed, rescanning immediately");
                }
            }
        }
    }
}

/// One blocking pass: file IO, classification, and alert dispatch stay
/// off the async workers.
async fn run_pass(app: &Arc<App>, config: &kwatch_core::Config, host_id: &str) -> PassStats {
    let app2 = Arc::clone(app);
    let config2 = config.clone();
    let host_id = host_id.to_string();
    tokio::task::spawn_blocking(move || {
        let detectors = DetectorSet::build(
            &config2.detection.enabled_detectors,
            config2.detection.search_mode,
            config2.detection.detectors.as_ref(),
        );
        let offsets = OffsetStore::load(app2.data_dir.join(INGEST_OFFSETS_FILE));
        let mut tailer = Tailer::new(detectors, host_id, offsets);

        let sink_app = Arc::clone(&app2);
        let sink_config = config2.clone();
        let mut sink = |event: Event| {
            if let Err(err) = sink_app.store.append(&event) {
                tracing::warn!(%err, "append failed during scan");
                return;
            }
            sink_app.broadcaster.publish(&event);
            if sink_config.alerts.enabled {
                sink_app.debouncer.evaluate(&event, &sink_config);
            }
        };
        let stats = tailer.run_incremental(&config2.detection.log_paths, &mut sink);
        if let Err(err) = tailer.commit_offsets() {
            tracing::warn!(%err, "failed to save scan offsets");
        }
        stats
    })
    .await
    .unwrap_or_else(|err| {
        tracing::error!(%err, "scan pass panicked");
        PassStats::default()
    })
}

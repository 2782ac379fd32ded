//! Application aggregate: wires every service with explicit ownership
//! and builds the HTTP router.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use kwatch_core::{Config, ConfigStore, CoreError, Event};
use parking_lot::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::alert::{AlertDebouncer, MailTransport, SmtpMailer, SmtpSettings, ALERT_STATE_FILE};
use crate::retention::GcOutcome;
use crate::scan_loop::INGEST_OFFSETS_FILE;
use crate::sse::Broadcaster;
use crate::store::{EventStore, StoreError};
use crate::{api, ingest, retention, scan_loop, sse};

pub struct App {
    pub config: Arc<ConfigStore>,
    pub store: EventStore,
    pub broadcaster: Arc<Broadcaster>,
    pub debouncer: Arc<AlertDebouncer>,
    pub data_dir: PathBuf,
    /// Timestamp of the most recent local scan pass.
    pub last_scan: RwLock<Option<String>>,
    pub start_time: chrono::DateTime<chrono::Utc>,
    /// GC never runs concurrently with itself.
    pub gc_lock: tokio::sync::Mutex<()>,
    pub scan_started: AtomicBool,
    pub cleanup_started: AtomicBool,
}

/// SMTP transport that resolves settings from the live config on every
/// dispatch, so a PUT /config takes effect without restart.
struct LiveMailer {
    config: Arc<ConfigStore>,
}

impl MailTransport for LiveMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), crate::alert::MailError> {
        let settings = SmtpSettings::resolve(&self.config.snapshot());
        SmtpMailer::new(settings).send(to, subject, body)
    }
}

impl App {
    /// Wire the services over a data directory and config file. Pass a
    /// transport to substitute mail dispatch in tests.
    pub fn new(
        data_dir: PathBuf,
        config_path: PathBuf,
        transport: Option<Box<dyn MailTransport>>,
    ) -> Result<Arc<App>, CoreError> {
        let config = Arc::new(ConfigStore::open(config_path)?);
        let store = EventStore::open(data_dir.clone())
            .map_err(|e| match e {
                StoreError::Io(io) => CoreError::Io(io),
                StoreError::Json(j) => CoreError::Json(j),
            })?;
        let transport = transport.unwrap_or_else(|| {
            Box::new(LiveMailer {
                config: Arc::clone(&config),
            })
        });
        let debouncer = Arc::new(AlertDebouncer::new(
            data_dir.join(ALERT_STATE_FILE),
            transport,
        ));
        Ok(Arc::new(App {
            config,
            store,
            broadcaster: Arc::new(Broadcaster::new()),
            debouncer,
            data_dir,
            last_scan: RwLock::new(None),
            start_time: chrono::Utc::now(),
            gc_lock: tokio::sync::Mutex::new(()),
            scan_started: AtomicBool::new(false),
            cleanup_started: AtomicBool::new(false),
        }))
    }

    /// Evaluate alerting for one event off the async path. Dispatch can
    /// block on SMTP for up to its timeout.
    pub fn evaluate_alert(self: &Arc<Self>, event: Event, config: Config) {
        if !config.alerts.enabled {
            return;
        }
        let debouncer = Arc::clone(&self.debouncer);
        tokio::task::spawn_blocking(move || {
            debouncer.evaluate(&event, &config);
        });
    }

    /// One guarded GC pass.
    pub async fn gc_once(self: &Arc<Self>, config: &Config) -> Result<GcOutcome, StoreError> {
        let _guard = self.gc_lock.lock().await;
        let app = Arc::clone(self);
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            let offsets = app.data_dir.join(INGEST_OFFSETS_FILE);
            retention::run_gc(&app.store, &config, Some(offsets.as_path()))
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    /// Start the singleton background tasks: retention loop, SSE
    /// heartbeat and tail-follower, and (when enabled) the local scan
    /// loop.
    pub fn spawn_background(self: &Arc<Self>) {
        let config = self.config.snapshot();
        tokio::spawn(retention::cleanup_loop(Arc::clone(self)));
        tokio::spawn(sse::heartbeat_loop(Arc::clone(&self.broadcaster)));
        tokio::spawn(sse::follower_loop(Arc::clone(self)));
        if config.detection.local_detection_enabled {
            tokio::spawn(scan_loop::scan_loop(Arc::clone(self)));
        } else {
            tracing::info!("local detection disabled, ingest-only mode");
        }
    }
}

/// The full HTTP surface. `web_dir` mounts the static dashboard when it
/// exists on disk.
pub fn build_router(app: Arc<App>, web_dir: Option<PathBuf>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/api/v1/stats", get(api::stats_handler))
        .route("/api/v1/events", get(api::events_handler))
        .route("/api/v1/events/:id", get(api::event_handler))
        .route("/api/v1/hosts", get(api::hosts_handler))
        .route(
            "/api/v1/config",
            get(api::config_get_handler).put(api::config_put_handler),
        )
        .route("/api/v1/ingest", axum::routing::post(ingest::ingest_handler))
        .route("/api/v1/stream", get(sse::stream_handler))
        .route("/api/v1/report", get(api::report_handler))
        .route("/api/v1/health", get(api::health_handler));

    if let Some(dir) = web_dir.filter(|d| d.is_dir()) {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router.layer(cors).with_state(app)
}

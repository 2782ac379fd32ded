//! Live event fan-out over Server-Sent Events.
//!
//! A broadcast channel carries frames to every connected client. Two
//! singleton background tasks feed it: a 15-second heartbeat and a
//! tail-follower that watches the event store file for appended lines.
//! The ingest path publishes directly as well; a shared seen-id set in
//! front of the channel guarantees no client is handed the same event id
//! twice. Fan-out is best effort: a receiver that lags behind the
//! channel is disconnected rather than back-pressuring the rest.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use kwatch_core::{now_ts, Event};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::api::ApiError;
use crate::app::App;

/// Heartbeat cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Poll interval of the tail-follower when at EOF.
const FOLLOW_IDLE: Duration = Duration::from_secs(1);

/// Bound on the seen-id set; cleared wholesale when exceeded.
const SEEN_CAP: usize = 100_000;

/// Per-client channel depth; a client this far behind is dropped.
const CHANNEL_CAPACITY: usize = 256;

/// One wire frame: a named SSE event with optional id.
#[derive(Debug, Clone)]
pub struct Frame {
    pub event: &'static str,
    pub id: Option<String>,
    pub data: String,
}

pub struct Broadcaster {
    tx: broadcast::Sender<Frame>,
    seen: Mutex<HashSet<String>>,
    clients: AtomicUsize,
    heartbeat_started: AtomicBool,
    follower_started: AtomicBool,
}

impl Broadcaster {
    pub fn new() -> Broadcaster {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Broadcaster {
            tx,
            seen: Mutex::new(HashSet::new()),
            clients: AtomicUsize::new(0),
            heartbeat_started: AtomicBool::new(false),
            follower_started: AtomicBool::new(false),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Publish an anomaly event unless its id was already broadcast in
    /// this process. Returns whether a frame went out.
    pub fn publish(&self, event: &Event) -> bool {
        {
            let mut seen = self.seen.lock();
            if seen.len() > SEEN_CAP {
                seen.clear();
            }
            if !seen.insert(event.id.clone()) {
                return false;
            }
        }
        let data = serde_json::json!({
            "id": event.id,
            "type": event.anomaly_type.as_str(),
            "severity": event.severity.as_str(),
            "message": event.message,
            "detected_at": event.detected_at,
            "host_id": event.host_id,
            "source_file": event.source_file,
        });
        let _ = self.tx.send(Frame {
            event: "anomaly",
            id: Some(event.id.clone()),
            data: data.to_string(),
        });
        true
    }

    fn send_ping(&self) {
        let data = serde_json::json!({ "ts": now_ts() });
        let _ = self.tx.send(Frame {
            event: "ping",
            id: None,
            data: data.to_string(),
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.tx.subscribe()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the client counter when the stream is dropped.
struct ClientGuard {
    broadcaster: Arc<Broadcaster>,
}

impl ClientGuard {
    fn register(broadcaster: Arc<Broadcaster>) -> ClientGuard {
        broadcaster.clients.fetch_add(1, Ordering::SeqCst);
        ClientGuard { broadcaster }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.broadcaster.clients.fetch_sub(1, Ordering::SeqCst);
    }
}

/// `GET /api/v1/stream` — SSE upgrade.
pub async fn stream_handler(State(app): State<Arc<App>>) -> Response {
    let config = app.config.snapshot();
    let broadcaster = Arc::clone(&app.broadcaster);
    if broadcaster.client_count() >= config.security.sse_max_clients {
        return ApiError::unavailable("sse client limit reached").into_response();
    }

    let guard = ClientGuard::register(Arc::clone(&broadcaster));
    let rx = broadcaster.subscribe();

    let open = SseEvent::default().event("open").data(
        serde_json::json!({ "status": "connected", "ts": now_ts() }).to_string(),
    );
    let frames = BroadcastStream::new(rx).map_while(move |item| {
        // Guard lives exactly as long as the stream.
        let _guard = &guard;
        match item {
            Ok(frame) => {
                let mut ev = SseEvent::default().event(frame.event).data(frame.data);
                if let Some(id) = frame.id {
                    ev = ev.id(id);
                }
                Some(Ok::<SseEvent, std::convert::Infallible>(ev))
            }
            // Lagged receiver: drop the slow client.
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "dropping lagged sse client");
                None
            }
        }
    });
    let stream = tokio_stream::once(Ok(open)).chain(frames);

    Sse::new(stream).into_response()
}

/// Singleton heartbeat task: `ping` every 15 s.
pub async fn heartbeat_loop(broadcaster: Arc<Broadcaster>) {
    if broadcaster.heartbeat_started.swap(true, Ordering::SeqCst) {
        return;
    }
    loop {
        tokio::time::sleep(PING_INTERVAL).await;
        broadcaster.send_ping();
    }
}

/// Singleton tail-follower: watches the event store file from EOF and
/// publishes every appended line. On truncation (retention rewrite made
/// the file shorter than our position) it re-seeks to EOF.
pub async fn follower_loop(app: Arc<App>) {
    let broadcaster = Arc::clone(&app.broadcaster);
    if broadcaster.follower_started.swap(true, Ordering::SeqCst) {
        return;
    }
    let path = app.store.events_path();
    let mut pos: u64 = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let mut buf = String::new();
    loop {
        let progressed = (|| -> std::io::Result<bool> {
            let len = std::fs::metadata(&path)?.len();
            if pos > len {
                pos = len;
                return Ok(false);
            }
            if pos == len {
                return Ok(false);
            }
            let mut file = std::fs::File::open(&path)?;
            file.seek(SeekFrom::Start(pos))?;
            let mut reader = BufReader::new(file);
            let mut any = false;
            loop {
                buf.clear();
                let n = reader.read_line(&mut buf)?;
                if n == 0 {
                    break;
                }
                // Hold back a torn tail line until its newline arrives.
                if !buf.ends_with('\n') {
                    break;
                }
                pos += n as u64;
                any = true;
                if let Ok(event) = serde_json::from_str::<Event>(buf.trim()) {
                    broadcaster.publish(&event);
                }
            }
            Ok(any)
        })()
        .unwrap_or(false);

        if !progressed {
            tokio::time::sleep(FOLLOW_IDLE).await;
        }
    }
}

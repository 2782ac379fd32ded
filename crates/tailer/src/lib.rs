//! Log tailing for kernelwatch.
//!
//! Enumerates candidate log files under configured roots, incrementally
//! reads them from saved byte offsets, and feeds each new line through
//! the classifier. The same pass runs inside the server (local
//! detection) and inside the remote agent (batch-and-report).

pub mod journal;
pub mod offsets;
pub mod pass;
pub mod scan;

pub use offsets::OffsetStore;
pub use pass::{EventSink, PassStats, Tailer};
pub use scan::collect_log_files;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TailerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

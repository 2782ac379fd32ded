use thiserror::Error;

/// Failures surfaced by the shared core: file-backed state and JSON codecs.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum MagpieError {
    #[error("Scope mismatch: {0}")]
    ScopeMismatch(String),

    #[error("Index load failed for {scope}: {reason}")]
    IndexLoad { scope: String, reason: String },

    #[error("Write apply failed for {scope}: {reason}")]
    WriteApply { scope: String, reason: String },

    #[error("Write retries exhausted after {retries} attempts for {scope}")]
    RetriesExhausted { scope: String, retries: u32 },

    #[error("Search failed: {0}")]
    Search(String),

    #[error("Rebuild failed for {scope}: {reason}")]
    Rebuild { scope: String, reason: String },

    #[error("Rebuild already in progress for {0}")]
    RebuildInProgress(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Document store error: {0}")]
    Store(String),

    #[error("Index error: {0}")]
    Ann(String),

    #[error("Write queue closed")]
    QueueClosed,

    #[error("Write queue full ({pending} operations pending)")]
    QueueFull { pending: usize },

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, MagpieError>;

impl From<std::io::Error> for MagpieError {
    fn from(e: std::io::Error) -> Self {
        MagpieError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for MagpieError {
    fn from(e: serde_json::Error) -> Self {
        MagpieError::Json(e.to_string())
    }
}

impl MagpieError {
    /// Transient errors are recovered locally (fallback, retry, rebuild) and
    /// surface only as warnings; everything else is caller misuse.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MagpieError::IndexLoad { .. }
                | MagpieError::WriteApply { .. }
                | MagpieError::Search(_)
                | MagpieError::Rebuild { .. }
                | MagpieError::Embedding(_)
                | MagpieError::Store(_)
                | MagpieError::Ann(_)
                | MagpieError::Io(_)
        )
    }
}

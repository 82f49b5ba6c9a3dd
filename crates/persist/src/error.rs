/// Errors raised by the persistence engine.
///
/// Codec callbacks return these too; block boundaries turn them into dropped records,
/// everything else propagates.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },
    #[error("invalid block length {0}")]
    InvalidBlockLength(i64),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("bad save file magic")]
    BadMagic,
    #[error("save not found: {0}")]
    NotFound(String),
}

impl PersistError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }

    /// Whether the error means the underlying stream can no longer be trusted to be aligned.
    pub fn is_framing(&self) -> bool {
        match self {
            Self::Truncated { .. } | Self::InvalidBlockLength(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PersistError>;

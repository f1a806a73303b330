/// Errors that can occur while sending or receiving frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer's stream ended before the requested bytes arrived.
    #[error("end of stream (peer closed before a complete frame arrived)")]
    Eof,

    /// A frame header declared a length above the configured ceiling.
    #[error("frame too large ({len} bytes, max {max})")]
    FrameTooLarge { len: u64, max: u64 },

    /// The connection was closed locally; no further I/O is possible.
    #[error("connection closed")]
    Closed,

    /// The child process was spawned without piped stdin/stdout.
    #[error("child process stdio is not piped")]
    NotPiped,

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A structured value failed to encode or decode.
    #[error("value codec error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;

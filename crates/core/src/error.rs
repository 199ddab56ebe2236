pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the chunk codec. Carried inline on `ReadOutcome` as well
/// as returned directly from `encode`/`decode`.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported chunk version: {0:#x}")]
    UnsupportedChunkVersion(u8),

    #[error("unknown hash algorithm id: {0:#x}")]
    UnknownHashAlgorithm(u8),

    #[error("hash mismatch: payload does not match stored hash")]
    HashMismatch,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("decompressed size {actual} does not match declared original size {expected}")]
    DecompressionSizeMismatch { expected: u32, actual: u32 },

    #[error("chunk bytes truncated: need at least {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("provider is not ready")]
    NotReady,

    #[error("stream is already open")]
    AlreadyOpen,

    #[error("stream is not open")]
    NotOpen,

    #[error("stream has been disposed")]
    Disposed,

    #[error("the requested file was not found in the index")]
    FileNotFound,

    #[error("provider is offline")]
    Offline,

    #[error("network unavailable: {message}")]
    NetworkUnavailable { message: String },

    #[error("remote resource not found")]
    NotFoundRemote,

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("failed to decode remote index: {message}")]
    IndexDecodeFailed { message: String },

    #[error("unsupported index version: {0:#x}")]
    UnsupportedIndexVersion(u8),

    #[error("index bytes truncated: need at least {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("index message is missing from the database channel")]
    IndexMessageMissing,

    #[error("operation cancelled")]
    Cancelled,
}

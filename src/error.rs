use std::fmt::Display;
use std::io;

/// A specialized error type for AOF operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum AofError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The manifest file failed strict validation.
    #[error("corrupt manifest: {0}")]
    ManifestCorruption(String),
    /// A segment could not be parsed or is corrupted.
    #[error("corrupt segment: {0}")]
    SegmentCorruption(String),
    /// Replay hit a command the sink does not understand.
    #[error("unknown command '{0}' during replay")]
    UnknownCommand(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// A rewrite could not be started.
    #[error("rewrite rejected: {0}")]
    RewriteRejected(String),
    /// Snapshot encode/decode error.
    #[error("snapshot codec error: {0}")]
    Snapshot(String),
    /// A generic error occurred.
    #[error("other error: {0}")]
    Other(String),
}

impl AofError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a manifest corruption error from a displayable value.
    pub fn manifest<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::ManifestCorruption(msg.to_string())
    }

    /// Create a segment corruption error from a displayable value.
    pub fn segment<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::SegmentCorruption(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }

    /// Create an opaque error from a displayable value.
    pub fn other<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Other(msg.to_string())
    }
}

/// A Result type alias for AOF operations.
pub type AofResult<T> = Result<T, AofError>;

/// Whether an I/O error is worth retrying in place (interrupted syscall,
/// transient contention) rather than being surfaced to the caller.
pub(crate) fn is_retryable_io_error(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            return true;
        }
        _ => {}
    }
    if let Some(code) = err.raw_os_error() {
        if matches!(
            code,
            libc::EINTR | libc::EAGAIN | libc::EBUSY | libc::ETIMEDOUT
        ) {
            return true;
        }
    }
    false
}

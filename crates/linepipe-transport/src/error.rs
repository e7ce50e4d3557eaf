/// Errors that can occur in pipe transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The platform could not allocate a pipe.
    #[error("failed to allocate pipe: {0}")]
    Resource(std::io::Error),

    /// A handle identifier received from the parent is unusable.
    #[error("invalid pipe handle '{handle}': {reason}")]
    InvalidHandle { handle: String, reason: String },

    /// The peer closed its end while we were writing.
    #[error("broken pipe (peer closed its read end)")]
    BrokenPipe,

    /// The endpoint was opened for the other direction.
    #[error("pipe endpoint is {actual}, operation requires {expected}")]
    WrongDirection {
        expected: &'static str,
        actual: &'static str,
    },

    /// A single line exceeded the configured maximum length.
    #[error("line too long ({len} bytes, max {max})")]
    LineTooLong { len: usize, max: usize },

    /// An I/O error occurred on the pipe.
    #[error("pipe I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The endpoint has already been closed.
    #[error("pipe endpoint closed")]
    Closed,
}

impl TransportError {
    /// Whether this error is a read deadline expiring rather than a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::Io(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                )
        )
    }

    pub(crate) fn invalid_handle(handle: &str, reason: impl Into<String>) -> Self {
        TransportError::InvalidHandle {
            handle: handle.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

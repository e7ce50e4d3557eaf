use std::time::Duration;

use linepipe_transport::TransportError;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The underlying pipe failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A payload line cannot be put on the wire as a single line.
    #[error("payload line {index} is not encodable: {reason}")]
    InvalidLine { index: usize, reason: &'static str },

    /// The stream ended after `SYNC` but before `END`.
    #[error("stream closed mid-frame after {} payload lines", lines.len())]
    Truncated { lines: Vec<String> },

    /// `END` did not arrive within the per-frame deadline.
    #[error("frame not terminated within {after:?} ({lines} payload lines read)")]
    Timeout { after: Duration, lines: usize },

    /// A frame carried more lines than allowed.
    #[error("frame too large (more than {max} lines)")]
    FrameTooLarge { max: usize },

    /// The peer closed the stream while no frame was open.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer went away while a frame was being written.
    #[error("broken pipe while writing frame")]
    BrokenPipe,

    /// An I/O error occurred while writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;

use crate::state::ChannelState;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Transport-level error (pipe allocation, invalid handle, broken pipe).
    #[error("transport error: {0}")]
    Transport(#[from] linepipe_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] linepipe_frame::FrameError),

    /// The child process could not be started.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The configuration asks for something the channel cannot do.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// The operation is not valid in the channel's current state.
    #[error("cannot {operation} while channel is {state}")]
    InvalidState {
        operation: &'static str,
        state: ChannelState,
    },

    /// The delivery callback panicked; the poller stopped.
    #[error("frame callback panicked")]
    CallbackPanicked,

    /// The poller worker thread died unexpectedly.
    #[error("poller worker panicked")]
    WorkerPanicked,

    /// Other I/O error (worker thread creation, child reaping).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

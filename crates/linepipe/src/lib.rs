//! Message channel between a parent process and the child it spawns.
//!
//! linepipe wires a pair of anonymous pipes to a child process and exchanges
//! text messages over them. Each message is a run of lines opened by a `SYNC`
//! line and closed by an `END` line; the receiving side polls its inbound pipe
//! on a fixed interval and hands every complete message to a callback.
//!
//! # Crate Structure
//!
//! - [`transport`]: Inheritable pipe endpoints and line I/O
//! - [`frame`]: `SYNC`/`END` framing over a line stream
//! - [`channel`]: Spawn/attach, polling and lifecycle (behind `channel` feature)
//! - `cli`: exit codes, logging and flag helpers for the bundled binaries
//!   (behind `cli` feature)

/// Re-export transport types.
pub mod transport {
    pub use linepipe_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use linepipe_frame::*;
}

/// Re-export channel types (requires `channel` feature).
#[cfg(feature = "channel")]
pub mod channel {
    pub use linepipe_channel::*;
}

#[cfg(feature = "cli")]
#[doc(hidden)]
pub mod cli;

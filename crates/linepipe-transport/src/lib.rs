//! Inheritable anonymous pipes for parent/child IPC.
//!
//! This is the lowest layer of linepipe. A host process creates
//! [`PipeEndpoint`]s, hands the child side to a spawned process (either as
//! its stdio or as a descriptor number on the command line), and then reads
//! and writes newline-delimited text through [`PipeReader`], [`PipeWriter`]
//! and [`LineReader`].

pub mod error;
pub mod line;

#[cfg(unix)]
pub mod pipe;

pub use error::{Result, TransportError};
pub use line::{LineReader, ReadTimeout, DEFAULT_MAX_LINE_LEN};

#[cfg(unix)]
pub use pipe::{EndpointState, PipeDirection, PipeEndpoint, PipeReader, PipeWriter};

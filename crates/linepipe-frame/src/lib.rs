//! `SYNC` / `END` line framing for linepipe.
//!
//! A frame is a run of text lines on the wire:
//!
//! ```text
//! SYNC
//! <line 1>
//! <line 2>
//! END
//! ```
//!
//! There is no length prefix and no escaping. Lines outside a frame are
//! dropped by the reader, and a payload line starting with `END` closes the
//! frame early; keeping such lines out of payloads is up to the sender.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    encode_frame, is_end_marker, is_sync_marker, Frame, FrameConfig, DEFAULT_FRAME_TIMEOUT,
    DEFAULT_MAX_FRAME_LINES, END_MARKER, SYNC_MARKER,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use linepipe_transport::DEFAULT_MAX_LINE_LEN;

use crate::error::{FrameError, Result};

/// Line that opens a frame.
pub const SYNC_MARKER: &str = "SYNC";

/// Line that closes a frame.
pub const END_MARKER: &str = "END";

/// Default deadline for the lines following `SYNC`: 5 seconds.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum number of payload lines in one frame.
pub const DEFAULT_MAX_FRAME_LINES: usize = 64 * 1024;

/// One decoded message: the payload lines between `SYNC` and `END`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    /// Payload lines in wire order, markers excluded.
    pub lines: Vec<String>,
}

impl Frame {
    /// Create a new frame.
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    /// Number of payload lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the frame carries no payload lines.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Take the payload lines.
    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// Whether `line` opens a frame. Any line starting with `SYNC` does.
pub fn is_sync_marker(line: &str) -> bool {
    line.starts_with(SYNC_MARKER)
}

/// Whether `line` closes a frame. Any line starting with `END` does.
pub fn is_end_marker(line: &str) -> bool {
    line.starts_with(END_MARKER)
}

/// Encode a frame into the wire format.
///
/// Payload lines starting with `SYNC` or `END` are written as-is; keeping
/// them out of the payload is up to the caller. Lines containing a line
/// break are rejected because they would reach the peer as several lines.
pub fn encode_frame<S: AsRef<str>>(lines: &[S], dst: &mut BytesMut) -> Result<()> {
    for (index, line) in lines.iter().enumerate() {
        if line.as_ref().contains(['\n', '\r']) {
            return Err(FrameError::InvalidLine {
                index,
                reason: "contains a line break",
            });
        }
    }

    let payload: usize = lines.iter().map(|l| l.as_ref().len() + 1).sum();
    dst.reserve(SYNC_MARKER.len() + END_MARKER.len() + 2 + payload);
    put_line(dst, SYNC_MARKER);
    for line in lines {
        put_line(dst, line.as_ref());
    }
    put_line(dst, END_MARKER);
    Ok(())
}

fn put_line(dst: &mut BytesMut, line: &str) {
    dst.put_slice(line.as_bytes());
    dst.put_u8(b'\n');
}

/// Configuration for frame reading.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// How long to wait for the line that might open a frame.
    ///
    /// `None` blocks. `Some(Duration::ZERO)` only looks at data already
    /// available, which is what a polling caller wants.
    pub idle_timeout: Option<Duration>,
    /// Deadline for all lines after `SYNC`. `None` waits forever.
    pub frame_timeout: Option<Duration>,
    /// Maximum length of one line in bytes. Default: 1 MiB.
    pub max_line_len: usize,
    /// Maximum number of payload lines per frame.
    pub max_frame_lines: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            frame_timeout: Some(DEFAULT_FRAME_TIMEOUT),
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_frame_lines: DEFAULT_MAX_FRAME_LINES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_markers_around_payload() {
        let mut buf = BytesMut::new();
        encode_frame(&["hello", "world"], &mut buf).unwrap();
        assert_eq!(buf.as_ref(), b"SYNC\nhello\nworld\nEND\n");
    }

    #[test]
    fn encodes_empty_frame() {
        let mut buf = BytesMut::new();
        encode_frame::<&str>(&[], &mut buf).unwrap();
        assert_eq!(buf.as_ref(), b"SYNC\nEND\n");
    }

    #[test]
    fn rejects_embedded_line_breaks() {
        let mut buf = BytesMut::new();
        let err = encode_frame(&["ok", "two\nlines"], &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::InvalidLine { index: 1, .. }));

        let err = encode_frame(&["carriage\rreturn"], &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::InvalidLine { index: 0, .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn marker_lines_are_not_escaped() {
        let mut buf = BytesMut::new();
        encode_frame(&["ENDING"], &mut buf).unwrap();
        assert_eq!(buf.as_ref(), b"SYNC\nENDING\nEND\n");
    }

    #[test]
    fn markers_match_by_prefix() {
        assert!(is_sync_marker("SYNC"));
        assert!(is_sync_marker("SYNC 42"));
        assert!(!is_sync_marker(" SYNC"));
        assert!(!is_sync_marker("sync"));

        assert!(is_end_marker("END"));
        assert!(is_end_marker("ENDOFMESSAGE"));
        assert!(!is_end_marker("THE END"));
    }

    #[test]
    fn frame_accessors() {
        let frame = Frame::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(frame.len(), 2);
        assert!(!frame.is_empty());
        assert_eq!(frame.into_lines(), vec!["a", "b"]);
        assert!(Frame::default().is_empty());
    }
}

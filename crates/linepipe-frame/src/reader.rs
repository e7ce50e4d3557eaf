use std::io::Read;
use std::time::{Duration, Instant};

use linepipe_transport::{LineReader, ReadTimeout};
use tracing::trace;

use crate::codec::{is_end_marker, is_sync_marker, Frame, FrameConfig};
use crate::error::{FrameError, Result};

/// Reads `SYNC` ... `END` frames from any line-oriented stream.
pub struct FrameReader<T> {
    lines: LineReader<T>,
    config: FrameConfig,
}

impl<T: Read + ReadTimeout> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            lines: LineReader::with_max_line_len(inner, config.max_line_len),
            config,
        }
    }

    /// Read one line and, if it opens a frame, the rest of that frame.
    ///
    /// Returns `Ok(None)` when the line does not start with `SYNC` (the line
    /// is dropped) or when no line arrived within `idle_timeout`. Once `SYNC`
    /// is seen the frame is read to its `END` line; the markers are not part
    /// of the returned payload.
    ///
    /// End of stream before a frame opens is `FrameError::ConnectionClosed`;
    /// inside a frame it is `FrameError::Truncated`.
    pub fn try_read_frame(&mut self) -> Result<Option<Frame>> {
        self.read_with_idle(self.config.idle_timeout)
    }

    /// Read the next complete frame (blocking), skipping lines outside frames.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.read_with_idle(None)? {
                return Ok(frame);
            }
        }
    }

    fn read_with_idle(&mut self, idle: Option<Duration>) -> Result<Option<Frame>> {
        let first = match self.lines.read_line_within(idle) {
            Ok(Some(line)) => line,
            Ok(None) => return Err(FrameError::ConnectionClosed),
            Err(err) if err.is_timeout() => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if !is_sync_marker(&first) {
            trace!(line = %first, "dropping line outside frame");
            return Ok(None);
        }

        self.read_body().map(Some)
    }

    fn read_body(&mut self) -> Result<Frame> {
        let frame_timeout = self.config.frame_timeout;
        let deadline = frame_timeout.map(|t| Instant::now() + t);
        let mut lines = Vec::new();

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.lines.read_line_within(remaining) {
                Ok(Some(line)) if is_end_marker(&line) => {
                    trace!(lines = lines.len(), "frame complete");
                    return Ok(Frame::new(lines));
                }
                Ok(Some(line)) => {
                    if lines.len() >= self.config.max_frame_lines {
                        return Err(FrameError::FrameTooLarge {
                            max: self.config.max_frame_lines,
                        });
                    }
                    lines.push(line);
                }
                Ok(None) => return Err(FrameError::Truncated { lines }),
                Err(err) if err.is_timeout() => {
                    return Err(FrameError::Timeout {
                        after: frame_timeout.unwrap_or_default(),
                        lines: lines.len(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        self.lines.get_ref()
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        self.lines.get_mut()
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.lines.into_inner()
    }

    /// Update how long `try_read_frame` waits for a leading line.
    pub fn set_idle_timeout(&mut self, idle_timeout: Option<Duration>) {
        self.config.idle_timeout = idle_timeout;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

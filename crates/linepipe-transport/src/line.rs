use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::error::{Result, TransportError};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Default maximum length of a single line: 1 MiB.
pub const DEFAULT_MAX_LINE_LEN: usize = 1024 * 1024;

/// A readable stream whose blocking reads can be bounded.
///
/// `None` blocks indefinitely. `Some(Duration::ZERO)` only consumes data that
/// is already available and fails with `ErrorKind::WouldBlock` otherwise.
pub trait ReadTimeout {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;
}

impl<T> ReadTimeout for std::io::Cursor<T> {
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }
}

impl ReadTimeout for &[u8] {
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }
}

/// Reads newline-delimited UTF-8 lines from any `Read` stream.
///
/// `\n` and `\r\n` terminators are stripped. A trailing line without a
/// terminator is returned once the peer closes its end. Bytes of a line that
/// has not fully arrived stay buffered across timed-out reads.
pub struct LineReader<T> {
    inner: T,
    buf: BytesMut,
    max_line_len: usize,
    eof: bool,
}

impl<T: Read> LineReader<T> {
    /// Create a line reader with the default maximum line length.
    pub fn new(inner: T) -> Self {
        Self::with_max_line_len(inner, DEFAULT_MAX_LINE_LEN)
    }

    /// Create a line reader with an explicit maximum line length.
    pub fn with_max_line_len(inner: T, max_line_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_line_len,
            eof: false,
        }
    }

    /// Read the next line (blocking).
    ///
    /// Returns `Ok(None)` at end of stream.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.next_line()? {
                return Ok(Some(line));
            }
            if self.eof {
                return self.take_remainder();
            }
            self.fill()?;
        }
    }

    /// Number of bytes received but not yet returned as a line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream, discarding buffered bytes.
    pub fn into_inner(self) -> T {
        self.inner
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
            if self.buf.len() > self.max_line_len {
                return Err(TransportError::LineTooLong {
                    len: self.buf.len(),
                    max: self.max_line_len,
                });
            }
            return Ok(None);
        };

        if pos > self.max_line_len {
            return Err(TransportError::LineTooLong {
                len: pos,
                max: self.max_line_len,
            });
        }

        let mut line = self.buf.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        decode(line).map(Some)
    }

    fn take_remainder(&mut self) -> Result<Option<String>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let rest = self.buf.split();
        decode(rest).map(Some)
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }
}

impl<T: Read + ReadTimeout> LineReader<T> {
    /// Read the next line, waiting at most `timeout` for it to complete.
    ///
    /// A line that is already buffered is returned without touching the
    /// stream. On expiry the error satisfies [`TransportError::is_timeout`].
    pub fn read_line_within(&mut self, timeout: Option<Duration>) -> Result<Option<String>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(line) = self.next_line()? {
                return Ok(Some(line));
            }
            if self.eof {
                return self.take_remainder();
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            self.inner.set_read_timeout(remaining)?;
            self.fill()?;
        }
    }
}

fn decode(line: BytesMut) -> Result<String> {
    String::from_utf8(line.to_vec())
        .map_err(|err| TransportError::Io(std::io::Error::new(ErrorKind::InvalidData, err)))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn reads_lines_and_strips_terminators() {
        let mut reader = LineReader::new(Cursor::new(b"one\ntwo\r\n\nthree".to_vec()));

        assert_eq!(reader.read_line().unwrap().as_deref(), Some("one"));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("two"));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some(""));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("three"));
        assert_eq!(reader.read_line().unwrap(), None);
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn empty_stream_is_end_of_stream() {
        let mut reader = LineReader::new(Cursor::new(Vec::<u8>::new()));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn byte_by_byte_source() {
        let reader = ByteByByteReader {
            bytes: b"SYNC\nslow line\n".to_vec(),
            pos: 0,
        };
        let mut lines = LineReader::new(reader);

        assert_eq!(lines.read_line().unwrap().as_deref(), Some("SYNC"));
        assert_eq!(lines.read_line().unwrap().as_deref(), Some("slow line"));
        assert_eq!(lines.read_line().unwrap(), None);
    }

    #[test]
    fn rejects_overlong_line() {
        let mut data = vec![b'a'; 64];
        data.push(b'\n');
        let mut reader = LineReader::with_max_line_len(Cursor::new(data), 16);

        let err = reader.read_line().unwrap_err();
        assert!(matches!(err, TransportError::LineTooLong { max: 16, .. }));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut reader = LineReader::new(Cursor::new(vec![0xff, 0xfe, b'\n']));
        let err = reader.read_line().unwrap_err();
        assert!(matches!(err, TransportError::Io(e) if e.kind() == ErrorKind::InvalidData));
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            interrupted: false,
            bytes: b"ok\n".to_vec(),
            pos: 0,
        };
        let mut lines = LineReader::new(reader);
        assert_eq!(lines.read_line().unwrap().as_deref(), Some("ok"));
    }

    #[test]
    fn partial_line_survives_would_block() {
        let reader = Scripted {
            steps: vec![
                Step::Data(b"hel".to_vec()),
                Step::WouldBlock,
                Step::Data(b"lo\n".to_vec()),
            ],
        };
        let mut lines = LineReader::new(reader);

        let err = lines.read_line().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(lines.buffered(), 3);
        assert_eq!(lines.read_line().unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn buffered_line_returned_without_reading() {
        let reader = Scripted {
            steps: vec![Step::Data(b"a\nb\n".to_vec()), Step::WouldBlock],
        };
        let mut lines = LineReader::new(reader);

        assert_eq!(
            lines.read_line_within(Some(Duration::ZERO)).unwrap().as_deref(),
            Some("a")
        );
        assert_eq!(
            lines.read_line_within(Some(Duration::ZERO)).unwrap().as_deref(),
            Some("b")
        );
        assert!(lines
            .read_line_within(Some(Duration::ZERO))
            .unwrap_err()
            .is_timeout());
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            let n = (self.bytes.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    enum Step {
        Data(Vec<u8>),
        WouldBlock,
    }

    struct Scripted {
        steps: Vec<Step>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.steps.is_empty() {
                return Ok(0);
            }
            match self.steps.remove(0) {
                Step::Data(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Step::WouldBlock => Err(std::io::Error::from(ErrorKind::WouldBlock)),
            }
        }
    }

    impl ReadTimeout for Scripted {
        fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
            Ok(())
        }
    }
}

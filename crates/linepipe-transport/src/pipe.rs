use std::collections::HashSet;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::line::ReadTimeout;

/// Which way bytes flow through an endpoint, seen from the process holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    /// This process reads; the peer writes.
    In,
    /// This process writes; the peer reads.
    Out,
}

impl PipeDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            PipeDirection::In => "in",
            PipeDirection::Out => "out",
        }
    }

    /// The direction the peer sees for the same pipe.
    pub fn reverse(self) -> Self {
        match self {
            PipeDirection::In => PipeDirection::Out,
            PipeDirection::Out => PipeDirection::In,
        }
    }
}

/// Endpoint lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Allocated; a server endpoint still holds the child's end.
    Created,
    /// The peer side is handed over (server) or opened (client).
    Connected,
    /// Both ends released by this process.
    Closed,
}

/// One end of a unidirectional anonymous pipe.
///
/// A server endpoint owns its local end (close-on-exec) and, until the child
/// is spawned, the child's end too. A client endpoint owns a descriptor it
/// inherited from its parent.
pub struct PipeEndpoint {
    direction: PipeDirection,
    local: Option<OwnedFd>,
    client: Option<OwnedFd>,
    state: EndpointState,
    claim: Option<ClaimGuard>,
}

impl PipeEndpoint {
    /// Create a fresh pipe for talking to a child process.
    ///
    /// Both descriptors are close-on-exec; the child's end is only made
    /// inheritable inside the spawned child.
    pub fn create_server(direction: PipeDirection) -> Result<Self> {
        let (read_end, write_end) = sys_pipe().map_err(TransportError::Resource)?;
        let (local, client) = match direction {
            PipeDirection::In => (read_end, write_end),
            PipeDirection::Out => (write_end, read_end),
        };

        debug!(
            direction = direction.as_str(),
            local_fd = local.as_raw_fd(),
            client_fd = client.as_raw_fd(),
            "created server pipe endpoint"
        );

        Ok(Self {
            direction,
            local: Some(local),
            client: Some(client),
            state: EndpointState::Created,
            claim: None,
        })
    }

    /// Open the child side of a pipe from a handle identifier passed by the parent.
    ///
    /// The identifier must name an open pipe descriptor whose access mode
    /// matches `direction` and that was inherited across `exec`, i.e. does
    /// not have `FD_CLOEXEC` set. Descriptors this process opened itself are
    /// rejected, and a descriptor can back only one endpoint at a time.
    pub fn open_client(direction: PipeDirection, handle: &str) -> Result<Self> {
        let fd: RawFd = handle
            .parse()
            .map_err(|_| TransportError::invalid_handle(handle, "not a descriptor number"))?;
        if fd < 0 {
            return Err(TransportError::invalid_handle(handle, "negative descriptor"));
        }
        Self::claim(direction, fd, handle)
    }

    /// Open this process's stdin as an inbound endpoint.
    ///
    /// Used when the parent wired the pipe to the child's stdio.
    pub fn from_stdin() -> Result<Self> {
        Self::claim(PipeDirection::In, libc::STDIN_FILENO, "stdin")
    }

    /// Open this process's stdout as an outbound endpoint.
    pub fn from_stdout() -> Result<Self> {
        Self::claim(PipeDirection::Out, libc::STDOUT_FILENO, "stdout")
    }

    fn claim(direction: PipeDirection, fd: RawFd, handle: &str) -> Result<Self> {
        validate_inherited(direction, fd, handle)?;

        let claim = ClaimGuard::acquire(fd).ok_or_else(|| {
            TransportError::invalid_handle(handle, "descriptor already claimed by another endpoint")
        })?;

        // SAFETY: `fd` is an open pipe without FD_CLOEXEC (checked above), so
        // it came through exec and no `OwnedFd` in this process wraps it. The
        // claim set keeps a second endpoint from wrapping it again.
        let local = unsafe { OwnedFd::from_raw_fd(fd) };
        set_cloexec(local.as_raw_fd(), true).map_err(TransportError::Io)?;

        debug!(
            direction = direction.as_str(),
            fd,
            handle,
            "opened client pipe endpoint"
        );

        Ok(Self {
            direction,
            local: Some(local),
            client: None,
            state: EndpointState::Connected,
            claim: Some(claim),
        })
    }

    /// The direction of this endpoint.
    pub fn direction(&self) -> PipeDirection {
        self.direction
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// Identifier of the child's end, to be passed on the child's command line.
    ///
    /// Only available on server endpoints before the child handle is released.
    pub fn handle_identifier(&self) -> Option<String> {
        self.client.as_ref().map(|fd| fd.as_raw_fd().to_string())
    }

    /// Raw descriptor of the child's end, for making it inheritable in the child.
    pub fn client_raw_fd(&self) -> Option<RawFd> {
        self.client.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Hand over ownership of the child's end (e.g. to become its stdin).
    pub fn take_client_handle(&mut self) -> Option<OwnedFd> {
        let handle = self.client.take();
        if handle.is_some() && self.state == EndpointState::Created {
            self.state = EndpointState::Connected;
        }
        handle
    }

    /// Close this process's copy of the child's end once the child has it.
    ///
    /// Until this runs, a reader never observes end of stream because the
    /// parent itself still holds a write end.
    pub fn release_client_handle(&mut self) {
        if let Some(fd) = self.client.take() {
            debug!(fd = fd.as_raw_fd(), "released client pipe handle");
        }
        if self.state == EndpointState::Created {
            self.state = EndpointState::Connected;
        }
    }

    /// Close both ends held by this process.
    pub fn close(&mut self) {
        self.local = None;
        self.client = None;
        self.claim = None;
        self.state = EndpointState::Closed;
    }

    /// Convert an inbound endpoint into a reader.
    pub fn into_reader(mut self) -> Result<PipeReader> {
        self.expect_direction(PipeDirection::In)?;
        let local = self.local.take().ok_or(TransportError::Closed)?;
        Ok(PipeReader {
            file: File::from(local),
            read_timeout: None,
            _claim: self.claim.take(),
        })
    }

    /// Convert an outbound endpoint into a writer.
    pub fn into_writer(mut self) -> Result<PipeWriter> {
        self.expect_direction(PipeDirection::Out)?;
        let local = self.local.take().ok_or(TransportError::Closed)?;
        Ok(PipeWriter {
            file: File::from(local),
            _claim: self.claim.take(),
        })
    }

    fn expect_direction(&self, expected: PipeDirection) -> Result<()> {
        if self.direction != expected {
            return Err(TransportError::WrongDirection {
                expected: expected.as_str(),
                actual: self.direction.as_str(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for PipeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEndpoint")
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("local_fd", &self.local.as_ref().map(AsRawFd::as_raw_fd))
            .field("client_fd", &self.client.as_ref().map(AsRawFd::as_raw_fd))
            .finish()
    }
}

/// Read half of a pipe.
///
/// Blocking by default; [`ReadTimeout::set_read_timeout`] bounds each read
/// with `poll(2)`.
pub struct PipeReader {
    file: File,
    read_timeout: Option<Duration>,
    // Declared after `file` so the claim is dropped once the descriptor is closed.
    _claim: Option<ClaimGuard>,
}

impl PipeReader {
    /// Current read timeout.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(timeout) = self.read_timeout {
            wait_readable(self.file.as_fd(), timeout)?;
        }
        self.file.read(buf)
    }
}

impl ReadTimeout for PipeReader {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }
}

impl AsRawFd for PipeReader {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader")
            .field("fd", &self.file.as_raw_fd())
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

/// Write half of a pipe.
pub struct PipeWriter {
    file: File,
    _claim: Option<ClaimGuard>,
}

impl PipeWriter {
    /// Write one line followed by `\n` and flush.
    pub fn write_line(&mut self, text: &str) -> Result<()> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.write_all(&line).map_err(map_write_error)?;
        self.flush().map_err(map_write_error)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl AsRawFd for PipeWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter")
            .field("fd", &self.file.as_raw_fd())
            .finish()
    }
}

fn map_write_error(err: io::Error) -> TransportError {
    if err.kind() == ErrorKind::BrokenPipe {
        TransportError::BrokenPipe
    } else {
        TransportError::Io(err)
    }
}

/// Descriptors currently owned by client endpoints of this process.
static CLAIMED_FDS: OnceLock<Mutex<HashSet<RawFd>>> = OnceLock::new();

/// Marks an inherited descriptor as owned until dropped.
struct ClaimGuard(RawFd);

impl ClaimGuard {
    fn acquire(fd: RawFd) -> Option<Self> {
        let mut claimed = CLAIMED_FDS
            .get_or_init(|| Mutex::new(HashSet::new()))
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        claimed.insert(fd).then_some(Self(fd))
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Some(claimed) = CLAIMED_FDS.get() {
            claimed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.0);
        }
    }
}

/// Clear or set `FD_CLOEXEC` on a descriptor.
///
/// Clearing is the only step needed to pass a pipe end to a child through
/// `exec`; it is async-signal-safe and may be called from a `pre_exec` hook.
pub fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD only inspect and update descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    let updated = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if updated != flags {
        // SAFETY: see above.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, updated) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn sys_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a valid two-element array for pipe2 to fill.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 returned two fresh descriptors owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn sys_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a valid two-element array for pipe to fill.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe returned two fresh descriptors owned by nobody else.
    let (read_end, write_end) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(read_end.as_raw_fd(), true)?;
    set_cloexec(write_end.as_raw_fd(), true)?;
    Ok((read_end, write_end))
}

fn validate_inherited(direction: PipeDirection, fd: RawFd, handle: &str) -> Result<()> {
    // SAFETY: F_GETFD on an arbitrary number only reports EBADF if it is not open.
    let fd_flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if fd_flags == -1 {
        return Err(TransportError::invalid_handle(
            handle,
            "descriptor is not open in this process",
        ));
    }

    // SAFETY: zeroed `stat` is a valid out-parameter for fstat.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: `fd` is open and `stat` is writable.
    if unsafe { libc::fstat(fd, &mut stat) } == -1 {
        return Err(TransportError::invalid_handle(
            handle,
            io::Error::last_os_error().to_string(),
        ));
    }
    if stat.st_mode & libc::S_IFMT != libc::S_IFIFO {
        return Err(TransportError::invalid_handle(handle, "descriptor is not a pipe"));
    }

    // SAFETY: F_GETFL only reports status flags of an open descriptor.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(TransportError::invalid_handle(
            handle,
            io::Error::last_os_error().to_string(),
        ));
    }
    let expected = match direction {
        PipeDirection::In => libc::O_RDONLY,
        PipeDirection::Out => libc::O_WRONLY,
    };
    if flags & libc::O_ACCMODE != expected {
        let reason = match direction {
            PipeDirection::In => "descriptor is not the read end of a pipe",
            PipeDirection::Out => "descriptor is not the write end of a pipe",
        };
        return Err(TransportError::invalid_handle(handle, reason));
    }

    // Descriptors that crossed exec never carry FD_CLOEXEC; every descriptor
    // this crate or std opens does, so a set flag means something here owns it.
    if fd_flags & libc::FD_CLOEXEC != 0 {
        return Err(TransportError::invalid_handle(
            handle,
            "descriptor is close-on-exec and was not inherited from the parent",
        ));
    }

    Ok(())
}

fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut pollfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pollfd` points to one valid, initialized pollfd entry.
        let rc = unsafe { libc::poll(&mut pollfd, 1, poll_timeout_ms(remaining)) };
        match rc {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            0 if timeout.is_zero() => {
                return Err(io::Error::new(ErrorKind::WouldBlock, "no data ready on pipe"));
            }
            0 => {
                return Err(io::Error::new(
                    ErrorKind::TimedOut,
                    format!("pipe read timed out after {timeout:?}"),
                ));
            }
            // POLLIN, POLLHUP and POLLERR all mean the next read will not block.
            _ => return Ok(()),
        }
    }
}

fn poll_timeout_ms(timeout: Duration) -> libc::c_int {
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    millis.min(libc::c_int::MAX as u128) as libc::c_int
}

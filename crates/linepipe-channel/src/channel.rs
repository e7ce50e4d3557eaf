use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use linepipe_frame::{FrameError, FrameReader, FrameWriter};
use linepipe_transport::pipe::set_cloexec;
use linepipe_transport::{PipeDirection, PipeEndpoint, PipeReader, PipeWriter, TransportError};
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, ClientHandles, ConnectionMode, Role};
use crate::error::{ChannelError, Result};
use crate::poller::Poller;
use crate::process::ProcessSpec;
use crate::state::{ChannelState, StopCause};

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A message channel to a child process (server role) or to the parent
/// process (client role).
///
/// ```no_run
/// use linepipe_channel::{Channel, ChannelConfig, ProcessSpec};
///
/// let config = ChannelConfig::server(ProcessSpec::new("worker"))
///     .on_frame(|lines| println!("received {lines:?}"));
/// let mut channel = Channel::new(config);
/// channel.start()?;
/// channel.send(&["hello"])?;
/// channel.stop()?;
/// # Ok::<(), linepipe_channel::ChannelError>(())
/// ```
pub struct Channel {
    config: ChannelConfig,
    state: ChannelState,
    writer: Option<FrameWriter<PipeWriter>>,
    poller: Option<Poller>,
    child: Option<Child>,
    exit_status: Option<ExitStatus>,
    stop_cause: Option<StopCause>,
}

type Pipes = (Option<PipeReader>, Option<PipeWriter>);

impl Channel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            state: ChannelState::Constructed,
            writer: None,
            poller: None,
            child: None,
            exit_status: None,
            stop_cause: None,
        }
    }

    /// Spawn or attach, then begin polling for inbound frames.
    ///
    /// Only valid once, from `Constructed`. On failure the channel is
    /// `Stopped`, a child that was already spawned is killed, and the error is
    /// returned.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ChannelState::Constructed {
            return Err(ChannelError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        self.state = ChannelState::Starting;

        match self.start_inner() {
            Ok(()) => {
                self.state = ChannelState::Running;
                info!(
                    direction = ?self.config.direction(),
                    mode = ?self.config.connection_mode(),
                    child = ?self.child_id(),
                    "channel running"
                );
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "channel failed to start");
                self.writer = None;
                if let Some(poller) = self.poller.take() {
                    poller.stop();
                }
                if let Some(child) = self.child.as_mut() {
                    if let Err(kill_err) = child.kill() {
                        warn!(error = %kill_err, "failed to kill child after start error");
                    }
                }
                if let Err(reap_err) = self.reap_child(Duration::ZERO) {
                    warn!(error = %reap_err, "failed to reap child after start error");
                }
                self.state = ChannelState::Stopped;
                self.stop_cause = Some(StopCause::Failed);
                Err(err)
            }
        }
    }

    fn start_inner(&mut self) -> Result<()> {
        self.config.validate()?;

        let (reader, writer) = match self.config.role().clone() {
            Role::Server(process) => self.spawn_server(&process)?,
            Role::Client(handles) => self.attach_client(&handles)?,
        };

        self.writer = writer.map(FrameWriter::new);

        if let Some(reader) = reader {
            let callback = self.config.delivery_callback().ok_or_else(|| {
                ChannelError::UnsupportedConfiguration("no frame callback set".to_string())
            })?;
            let mut frame_config = self.config.frame_config().clone();
            frame_config.idle_timeout = Some(Duration::ZERO);

            let poller = Poller::start(
                FrameReader::with_config(reader, frame_config),
                self.config.poll_interval(),
                callback,
                self.config.error_callback(),
            )?;
            self.poller = Some(poller);
        }

        Ok(())
    }

    fn spawn_server(&mut self, process: &ProcessSpec) -> Result<Pipes> {
        let direction = self.config.direction();
        let mut inbound = direction
            .reads()
            .then(|| PipeEndpoint::create_server(PipeDirection::In))
            .transpose()?;
        let mut outbound = direction
            .writes()
            .then(|| PipeEndpoint::create_server(PipeDirection::Out))
            .transpose()?;

        let mut command = match self.config.connection_mode() {
            ConnectionMode::CommandLineHandles => {
                // The child reads what we write and writes what we read.
                let handles = ClientHandles::new(
                    outbound.as_ref().and_then(PipeEndpoint::handle_identifier),
                    inbound.as_ref().and_then(PipeEndpoint::handle_identifier),
                );
                let inheritable: Vec<RawFd> = [&inbound, &outbound]
                    .into_iter()
                    .flatten()
                    .filter_map(PipeEndpoint::client_raw_fd)
                    .collect();

                let mut command = process.command(&handles.to_args());
                // SAFETY: the hook only calls fcntl(2), which is
                // async-signal-safe, and does not allocate.
                unsafe {
                    command.pre_exec(move || {
                        for fd in &inheritable {
                            set_cloexec(*fd, false)?;
                        }
                        Ok(())
                    });
                }
                debug!(
                    program = %process.display_name(),
                    inbound = handles.inbound(),
                    outbound = handles.outbound(),
                    "passing pipe handles on command line"
                );
                command
            }
            ConnectionMode::InheritedHandles => {
                let mut command = process.command(&[]);
                if let Some(fd) = outbound.as_mut().and_then(PipeEndpoint::take_client_handle) {
                    command.stdin(Stdio::from(fd));
                }
                if let Some(fd) = inbound.as_mut().and_then(PipeEndpoint::take_client_handle) {
                    command.stdout(Stdio::from(fd));
                }
                command
            }
        };

        let child = command.spawn().map_err(|source| ChannelError::Spawn {
            program: process.display_name(),
            source,
        })?;
        // The command holds the child's stdio ends in inherited mode.
        drop(command);
        info!(pid = child.id(), program = %process.display_name(), "spawned child");
        self.child = Some(child);

        for endpoint in [&mut inbound, &mut outbound].into_iter().flatten() {
            endpoint.release_client_handle();
        }

        let reader = inbound.map(PipeEndpoint::into_reader).transpose()?;
        let writer = outbound.map(PipeEndpoint::into_writer).transpose()?;
        Ok((reader, writer))
    }

    fn attach_client(&self, handles: &ClientHandles) -> Result<Pipes> {
        let direction = self.config.direction();
        let (inbound, outbound) = match self.config.connection_mode() {
            ConnectionMode::CommandLineHandles => (
                direction
                    .reads()
                    .then(|| open_handle(PipeDirection::In, handles.inbound()))
                    .transpose()?,
                direction
                    .writes()
                    .then(|| open_handle(PipeDirection::Out, handles.outbound()))
                    .transpose()?,
            ),
            ConnectionMode::InheritedHandles => (
                direction
                    .reads()
                    .then(PipeEndpoint::from_stdin)
                    .transpose()?,
                direction
                    .writes()
                    .then(PipeEndpoint::from_stdout)
                    .transpose()?,
            ),
        };

        let reader = inbound.map(PipeEndpoint::into_reader).transpose()?;
        let writer = outbound.map(PipeEndpoint::into_writer).transpose()?;
        Ok((reader, writer))
    }

    /// Send `lines` to the peer as one frame.
    pub fn send<S: AsRef<str>>(&mut self, lines: &[S]) -> Result<()> {
        let state = self.state();
        if state != ChannelState::Running {
            return Err(ChannelError::InvalidState {
                operation: "send",
                state,
            });
        }
        let direction = self.config.direction();
        let writer = self.writer.as_mut().ok_or_else(|| {
            ChannelError::UnsupportedConfiguration(format!(
                "direction {direction:?} has no outbound pipe"
            ))
        })?;
        writer.send(lines)?;
        Ok(())
    }

    /// Stop the channel. Idempotent.
    ///
    /// Closes the outbound pipe so the peer sees end of stream, stops and
    /// joins the poller, then gives a spawned child the configured grace
    /// period to exit before killing it. Returns the error the poller stopped
    /// on, unless it was the peer closing its end between frames.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            ChannelState::Stopped => return Ok(()),
            ChannelState::Constructed => {
                self.state = ChannelState::Stopped;
                self.stop_cause = Some(StopCause::Requested);
                return Ok(());
            }
            ChannelState::Starting | ChannelState::Running => {}
        }

        debug!("stopping channel");
        self.writer = None;
        let polled = match self.poller.take() {
            Some(poller) => {
                poller.stop();
                poller.join()
            }
            None => Ok(()),
        };
        self.finish(polled, "channel stopped")
    }

    /// Block until the inbound stream ends, then shut the channel down.
    ///
    /// The outbound pipe stays open while waiting. A peer closing its end
    /// between frames is a normal end and returns `Ok`.
    pub fn wait(&mut self) -> Result<()> {
        if self.state != ChannelState::Running {
            return Err(ChannelError::InvalidState {
                operation: "wait",
                state: self.state,
            });
        }
        let poller = self.poller.take().ok_or_else(|| {
            ChannelError::UnsupportedConfiguration(
                "channel has no inbound pipe to wait on".to_string(),
            )
        })?;

        let polled = poller.join();
        self.writer = None;
        self.finish(polled, "channel finished")
    }

    fn finish(&mut self, polled: Result<()>, message: &'static str) -> Result<()> {
        let reaped = self.reap_child(self.config.shutdown_grace());
        self.state = ChannelState::Stopped;

        let (cause, result) = match (polled, reaped) {
            (Err(ChannelError::Frame(FrameError::ConnectionClosed)), Ok(())) => {
                (StopCause::PeerClosed, Ok(()))
            }
            (Err(ChannelError::Frame(FrameError::ConnectionClosed)), Err(err)) => {
                (StopCause::Failed, Err(err))
            }
            (Err(err), _) => (StopCause::Failed, Err(err)),
            (Ok(()), Ok(())) => (StopCause::Requested, Ok(())),
            (Ok(()), Err(err)) => (StopCause::Failed, Err(err)),
        };
        self.stop_cause = Some(cause);
        info!(exit_status = ?self.exit_status, %cause, "{message}");
        result
    }

    /// Current state. A running channel whose poller has stopped on an error
    /// reports `Stopped`.
    pub fn state(&self) -> ChannelState {
        match (self.state, &self.poller) {
            (ChannelState::Running, Some(poller)) if !poller.is_running() => {
                ChannelState::Stopped
            }
            (state, _) => state,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Process id of the spawned child, while it has not been reaped.
    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Why the channel stopped, once it has.
    ///
    /// `PeerClosed` tells a peer hanging up between frames apart from a
    /// requested stop; both return `Ok` from [`Channel::stop`].
    pub fn stop_cause(&self) -> Option<StopCause> {
        self.stop_cause
    }

    /// Exit status of the spawned child once it has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Whether an inbound poller exists.
    pub fn has_inbound(&self) -> bool {
        self.poller.is_some()
    }

    /// Whether an outbound pipe is open.
    pub fn has_outbound(&self) -> bool {
        self.writer.is_some()
    }

    /// Frames delivered to the callback so far.
    pub fn frames_received(&self) -> u64 {
        self.poller.as_ref().map_or(0, Poller::frames_delivered)
    }

    fn reap_child(&mut self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pid = child.id();
        let deadline = Instant::now() + grace;

        loop {
            if let Some(status) = child.try_wait()? {
                debug!(pid, %status, "child exited");
                self.exit_status = Some(status);
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(REAP_POLL_INTERVAL));
        }

        if !grace.is_zero() {
            warn!(pid, ?grace, "child still running after grace period; killing");
        }
        // Fails only if the child exited in the meantime.
        if let Err(err) = child.kill() {
            debug!(pid, error = %err, "kill failed");
        }
        let status = child.wait()?;
        debug!(pid, %status, "child reaped");
        self.exit_status = Some(status);
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "channel stopped with error on drop");
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state())
            .field("direction", &self.config.direction())
            .field("child", &self.child_id())
            .field("inbound", &self.has_inbound())
            .field("outbound", &self.has_outbound())
            .finish()
    }
}

fn open_handle(
    direction: PipeDirection,
    handle: Option<&str>,
) -> linepipe_transport::Result<PipeEndpoint> {
    let handle = handle.ok_or_else(|| TransportError::InvalidHandle {
        handle: ClientHandles::ABSENT.to_string(),
        reason: format!("no {} handle was passed", direction.as_str()),
    })?;
    PipeEndpoint::open_client(direction, handle)
}

#[cfg(test)]
mod tests {
    use std::os::fd::IntoRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::Direction;
    use crate::process::StdioPolicy;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn shell(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh").arg("-c").arg(script)
    }

    fn inherited(process: ProcessSpec) -> ChannelConfig {
        ChannelConfig::server(process)
            .with_connection_mode(ConnectionMode::InheritedHandles)
            .with_poll_interval(Duration::from_millis(50))
    }

    fn collecting(config: ChannelConfig) -> (ChannelConfig, mpsc::Receiver<Vec<String>>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let config = config.on_frame(move |lines| {
            let _ = tx.lock().unwrap().send(lines);
        });
        (config, rx)
    }

    #[test]
    fn out_only_start_creates_no_poller() {
        let config = inherited(ProcessSpec::new("cat").unused_stdio(StdioPolicy::Null))
            .with_direction(Direction::Out);
        let mut channel = Channel::new(config);
        channel.start().unwrap();

        assert_eq!(channel.state(), ChannelState::Running);
        assert!(!channel.has_inbound());
        assert!(channel.has_outbound());
        assert!(channel.child_id().is_some());

        channel.send(&["discarded"]).unwrap();
        channel.stop().unwrap();
        assert!(channel.exit_status().unwrap().success());
    }

    #[test]
    fn child_frame_is_delivered() {
        let (config, rx) = collecting(
            inherited(shell("printf 'noise\\nSYNC\\nhello\\nworld\\nEND\\n'"))
                .with_direction(Direction::In),
        );
        let mut channel = Channel::new(config);
        channel.start().unwrap();

        let lines = rx.recv_timeout(RECV_TIMEOUT).expect("frame from child");
        assert_eq!(lines, vec!["hello", "world"]);

        channel.wait().unwrap();
        assert_eq!(channel.state(), ChannelState::Stopped);
        assert!(channel.exit_status().unwrap().success());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn bidirectional_frame_arrives_within_two_ticks() {
        const POLL: Duration = Duration::from_millis(50);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let config = inherited(shell("printf 'SYNC\\nhello\\nworld\\nEND\\n'"))
            .with_direction(Direction::Bidirectional)
            .with_poll_interval(POLL)
            .on_frame(move |lines| {
                let _ = tx.lock().unwrap().send((lines, Instant::now()));
            });
        let mut channel = Channel::new(config);

        let started = Instant::now();
        channel.start().unwrap();
        let (lines, delivered_at) = rx.recv_timeout(RECV_TIMEOUT).expect("frame from child");
        assert_eq!(lines, vec!["hello", "world"]);

        // One tick may run before the child has written; the next one must see it.
        let latency = delivered_at.duration_since(started);
        assert!(
            latency < POLL * 2 + Duration::from_millis(50),
            "frame took {latency:?} to arrive"
        );

        assert!(rx.recv_timeout(POLL * 4).is_err());
        assert_eq!(channel.frames_received(), 1);
        channel.stop().unwrap();
        assert!(rx.try_recv().is_err());
        assert!(channel.exit_status().unwrap().success());
    }

    #[test]
    fn consecutive_frames_arrive_in_order() {
        let (config, rx) = collecting(
            inherited(shell("printf 'SYNC\\na\\nEND\\nSYNC\\nb\\nc\\nEND\\n'"))
                .with_direction(Direction::In),
        );
        let mut channel = Channel::new(config);
        channel.start().unwrap();
        channel.wait().unwrap();

        let frames: Vec<_> = rx.try_iter().collect();
        assert_eq!(frames, vec![vec!["a"], vec!["b", "c"]]);
    }

    #[test]
    fn bidirectional_echo_through_cat() {
        let (config, rx) = collecting(inherited(ProcessSpec::new("cat")));
        let mut channel = Channel::new(config);
        channel.start().unwrap();
        assert!(channel.has_inbound() && channel.has_outbound());

        channel.send(&["ping", "pong"]).unwrap();
        let lines = rx.recv_timeout(RECV_TIMEOUT).expect("echoed frame");
        assert_eq!(lines, vec!["ping", "pong"]);

        channel.stop().unwrap();
        assert!(channel.exit_status().unwrap().success());
    }

    #[test]
    fn truncated_stream_reports_error_without_delivery() {
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        let (config, rx) = collecting(
            inherited(shell("printf 'SYNC\\npartial\\n'"))
                .with_direction(Direction::In)
                .on_error(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
        );
        let mut channel = Channel::new(config);
        channel.start().unwrap();

        let err = channel.wait().unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Frame(FrameError::Truncated { ref lines }) if lines == &["partial"]
        ));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(channel.stop_cause(), Some(StopCause::Failed));
    }

    #[test]
    fn state_reports_stopped_after_peer_exit() {
        let (config, _rx) = collecting(inherited(shell("exit 0")).with_direction(Direction::In));
        let mut channel = Channel::new(config);
        channel.start().unwrap();

        let deadline = Instant::now() + RECV_TIMEOUT;
        while channel.state() == ChannelState::Running && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(channel.state(), ChannelState::Stopped);
        assert!(matches!(
            channel.send(&["late"]),
            Err(ChannelError::InvalidState { .. })
        ));
        channel.stop().unwrap();
        assert_eq!(channel.stop_cause(), Some(StopCause::PeerClosed));
    }

    #[test]
    fn malformed_client_handle_never_runs() {
        let config = ChannelConfig::client(ClientHandles::new(Some("not-a-fd".into()), None))
            .with_direction(Direction::In)
            .on_frame(|_| {});
        let mut channel = Channel::new(config);

        let err = channel.start().unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport(TransportError::InvalidHandle { .. })
        ));
        assert_eq!(channel.state(), ChannelState::Stopped);
    }

    #[test]
    fn missing_client_handle_is_invalid() {
        let config = ChannelConfig::client(ClientHandles::new(None, None))
            .with_direction(Direction::Out);
        let mut channel = Channel::new(config);
        assert!(matches!(
            channel.start(),
            Err(ChannelError::Transport(TransportError::InvalidHandle { .. }))
        ));
    }

    #[test]
    fn client_attaches_to_descriptor_from_parent() {
        let mut server = PipeEndpoint::create_server(PipeDirection::Out).unwrap();
        let raw = server.take_client_handle().unwrap().into_raw_fd();
        // Stand in for exec, which leaves inherited descriptors without FD_CLOEXEC.
        set_cloexec(raw, false).unwrap();
        let id = raw.to_string();

        let (config, rx) = collecting(
            ChannelConfig::client(ClientHandles::new(Some(id), None))
                .with_direction(Direction::In)
                .with_poll_interval(Duration::from_millis(20)),
        );
        let mut channel = Channel::new(config);
        channel.start().unwrap();
        assert!(channel.child_id().is_none());

        let mut writer = FrameWriter::new(server.into_writer().unwrap());
        writer.send(&["from parent"]).unwrap();
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), vec!["from parent"]);

        drop(writer);
        channel.wait().unwrap();
        assert_eq!(channel.stop_cause(), Some(StopCause::PeerClosed));
    }

    #[test]
    fn reading_without_callback_fails_start() {
        let mut channel = Channel::new(inherited(ProcessSpec::new("cat")));
        assert!(matches!(
            channel.start(),
            Err(ChannelError::UnsupportedConfiguration(_))
        ));
        assert_eq!(channel.state(), ChannelState::Stopped);
        assert!(channel.child_id().is_none());
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let config = inherited(ProcessSpec::new("/nonexistent/linepipe-test-child"))
            .with_direction(Direction::Out);
        let mut channel = Channel::new(config);

        let err = channel.start().unwrap_err();
        assert!(matches!(err, ChannelError::Spawn { ref program, .. } if program.contains("linepipe-test-child")));
        assert_eq!(channel.state(), ChannelState::Stopped);
    }

    #[test]
    fn start_twice_is_invalid() {
        let config = inherited(ProcessSpec::new("cat").unused_stdio(StdioPolicy::Null))
            .with_direction(Direction::Out);
        let mut channel = Channel::new(config);
        channel.start().unwrap();

        assert!(matches!(
            channel.start(),
            Err(ChannelError::InvalidState {
                operation: "start",
                state: ChannelState::Running
            })
        ));
        channel.stop().unwrap();
    }

    #[test]
    fn send_requires_outbound_pipe() {
        let (config, _rx) =
            collecting(inherited(shell("sleep 1")).with_direction(Direction::In));
        let mut channel = Channel::new(config);
        channel.start().unwrap();

        assert!(matches!(
            channel.send(&["x"]),
            Err(ChannelError::UnsupportedConfiguration(_))
        ));
        channel.stop().unwrap();
    }

    #[test]
    fn stop_is_idempotent() {
        let mut channel = Channel::new(inherited(ProcessSpec::new("cat")));
        channel.stop().unwrap();
        channel.stop().unwrap();
        assert_eq!(channel.state(), ChannelState::Stopped);
        assert!(matches!(
            channel.start(),
            Err(ChannelError::InvalidState { .. })
        ));
    }

    #[test]
    fn stop_kills_child_after_grace_period() {
        let (config, _rx) = collecting(
            inherited(ProcessSpec::new("sleep").arg("30"))
                .with_direction(Direction::In)
                .with_shutdown_grace(Duration::from_millis(100)),
        );
        let mut channel = Channel::new(config);
        channel.start().unwrap();

        let started = Instant::now();
        channel.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!channel.exit_status().unwrap().success());
        assert_eq!(channel.stop_cause(), Some(StopCause::Requested));
    }

    #[test]
    fn callback_panic_surfaces_from_wait() {
        let config = inherited(shell("printf 'SYNC\\nboom\\nEND\\n'"))
            .with_direction(Direction::In)
            .on_frame(|_| panic!("callback failure"));
        let mut channel = Channel::new(config);
        channel.start().unwrap();

        assert!(matches!(channel.wait(), Err(ChannelError::CallbackPanicked)));
    }
}

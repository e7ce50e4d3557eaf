use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use linepipe_frame::FrameConfig;
use linepipe_transport::TransportError;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};
use crate::process::ProcessSpec;

/// Default poll interval: 100 ms.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time a stopping server waits for its child before killing it.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Receives the payload lines of each decoded frame.
pub type DeliveryCallback = Arc<dyn Fn(Vec<String>) + Send + Sync>;

/// Notified once when the poller stops on an error.
pub type ErrorCallback = Arc<dyn Fn(&ChannelError) + Send + Sync>;

/// Which pipes a channel uses, seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Receive frames only.
    In,
    /// Send frames only. No poller is created.
    Out,
    /// Receive and send on two separate pipes.
    Bidirectional,
}

impl Direction {
    /// Whether this direction needs an inbound pipe.
    pub fn reads(self) -> bool {
        matches!(self, Direction::In | Direction::Bidirectional)
    }

    /// Whether this direction needs an outbound pipe.
    pub fn writes(self) -> bool {
        matches!(self, Direction::Out | Direction::Bidirectional)
    }
}

/// How the child side obtains its pipe ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// The child's pipe ends become its stdin and stdout.
    InheritedHandles,
    /// The child inherits descriptors whose numbers are passed as its first
    /// two arguments.
    #[default]
    CommandLineHandles,
}

/// Which side of the channel this process is.
#[derive(Debug, Clone)]
pub enum Role {
    /// Create the pipes and spawn the described child.
    Server(ProcessSpec),
    /// Attach to pipes inherited from the parent.
    Client(ClientHandles),
}

/// Handle identifiers a client received from its parent.
///
/// `inbound` is the pipe this process reads (`argv[1]`), `outbound` the
/// pipe it writes (`argv[2]`). The parent passes [`ClientHandles::ABSENT`]
/// for a pipe it did not create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHandles {
    inbound: Option<String>,
    outbound: Option<String>,
}

impl ClientHandles {
    /// Placeholder argument for a pipe that does not exist.
    pub const ABSENT: &'static str = "-";

    pub fn new(inbound: Option<String>, outbound: Option<String>) -> Self {
        Self {
            inbound: inbound.filter(|h| h != Self::ABSENT),
            outbound: outbound.filter(|h| h != Self::ABSENT),
        }
    }

    /// Parse handles from a full argument vector (`argv[0]` is the program).
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = args.into_iter().skip(1).map(Into::into);
        let inbound = args.next().ok_or_else(|| missing_handle("argv[1]"))?;
        let outbound = args.next().ok_or_else(|| missing_handle("argv[2]"))?;
        Ok(Self::new(Some(inbound), Some(outbound)))
    }

    /// Parse handles from this process's command line.
    pub fn from_env() -> Result<Self> {
        Self::from_args(std::env::args())
    }

    /// Handle of the pipe this process reads.
    pub fn inbound(&self) -> Option<&str> {
        self.inbound.as_deref()
    }

    /// Handle of the pipe this process writes.
    pub fn outbound(&self) -> Option<&str> {
        self.outbound.as_deref()
    }

    /// Render as the two leading child arguments.
    pub fn to_args(&self) -> [String; 2] {
        [
            self.inbound.clone().unwrap_or_else(|| Self::ABSENT.to_string()),
            self.outbound
                .clone()
                .unwrap_or_else(|| Self::ABSENT.to_string()),
        ]
    }

    fn is_empty(&self) -> bool {
        self.inbound.is_none() && self.outbound.is_none()
    }
}

fn missing_handle(position: &str) -> ChannelError {
    TransportError::InvalidHandle {
        handle: String::new(),
        reason: format!("missing {position}"),
    }
    .into()
}

/// Everything a [`Channel`](crate::Channel) needs; fixed once the channel is built.
#[derive(Clone)]
pub struct ChannelConfig {
    role: Role,
    direction: Direction,
    poll_interval: Duration,
    connection_mode: ConnectionMode,
    frame: FrameConfig,
    shutdown_grace: Duration,
    on_frame: Option<DeliveryCallback>,
    on_error: Option<ErrorCallback>,
}

impl ChannelConfig {
    /// Configure a channel that spawns `process`.
    pub fn server(process: ProcessSpec) -> Self {
        Self::with_role(Role::Server(process))
    }

    /// Configure a channel attached to handles inherited from the parent.
    pub fn client(handles: ClientHandles) -> Self {
        Self::with_role(Role::Client(handles))
    }

    fn with_role(role: Role) -> Self {
        Self {
            role,
            direction: Direction::Bidirectional,
            poll_interval: DEFAULT_POLL_INTERVAL,
            connection_mode: ConnectionMode::default(),
            frame: FrameConfig::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            on_frame: None,
            on_error: None,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.connection_mode = mode;
        self
    }

    /// Frame limits and deadlines. `idle_timeout` is managed by the poller.
    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    /// How long `stop` waits for a spawned child to exit before killing it.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Callback receiving each inbound frame's payload lines.
    pub fn on_frame<F>(mut self, callback: F) -> Self
    where
        F: Fn(Vec<String>) + Send + Sync + 'static,
    {
        self.on_frame = Some(Arc::new(callback));
        self
    }

    /// Callback notified when the poller stops on an error.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChannelError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        self.connection_mode
    }

    pub fn frame_config(&self) -> &FrameConfig {
        &self.frame
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub(crate) fn delivery_callback(&self) -> Option<DeliveryCallback> {
        self.on_frame.clone()
    }

    pub(crate) fn error_callback(&self) -> Option<ErrorCallback> {
        self.on_error.clone()
    }

    /// Reject combinations the channel cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.direction.reads() {
            if self.on_frame.is_none() {
                return Err(ChannelError::UnsupportedConfiguration(format!(
                    "direction {:?} receives frames but no frame callback is set",
                    self.direction
                )));
            }
            if self.poll_interval.is_zero() {
                return Err(ChannelError::UnsupportedConfiguration(
                    "poll interval must be greater than zero".to_string(),
                ));
            }
        }

        if let Role::Client(handles) = &self.role {
            if self.connection_mode == ConnectionMode::InheritedHandles && !handles.is_empty() {
                return Err(ChannelError::UnsupportedConfiguration(
                    "client handles given, but inherited-handles mode uses stdin/stdout"
                        .to_string(),
                ));
            }
        }

        if self.frame.max_frame_lines == 0 || self.frame.max_line_len == 0 {
            return Err(ChannelError::UnsupportedConfiguration(
                "frame limits must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("role", &self.role)
            .field("direction", &self.direction)
            .field("poll_interval", &self.poll_interval)
            .field("connection_mode", &self.connection_mode)
            .field("frame", &self.frame)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("on_frame", &self.on_frame.as_ref().map(|_| "<callback>"))
            .field("on_error", &self.on_error.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_handles_from_args() {
        let handles = ClientHandles::from_args(["peer", "5", "-", "--echo"]).unwrap();
        assert_eq!(handles.inbound(), Some("5"));
        assert_eq!(handles.outbound(), None);
        assert_eq!(handles.to_args(), ["5".to_string(), "-".to_string()]);
    }

    #[test]
    fn client_handles_require_both_positions() {
        let err = ClientHandles::from_args(["peer", "5"]).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport(TransportError::InvalidHandle { .. })
        ));

        let err = ClientHandles::from_args(["peer"]).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport(TransportError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn direction_flags() {
        assert!(Direction::In.reads() && !Direction::In.writes());
        assert!(!Direction::Out.reads() && Direction::Out.writes());
        assert!(Direction::Bidirectional.reads() && Direction::Bidirectional.writes());
    }

    #[test]
    fn defaults() {
        let config = ChannelConfig::server(ProcessSpec::new("worker"));
        assert_eq!(config.direction(), Direction::Bidirectional);
        assert_eq!(config.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(config.connection_mode(), ConnectionMode::CommandLineHandles);
        assert_eq!(config.shutdown_grace(), DEFAULT_SHUTDOWN_GRACE);
        assert!(matches!(config.role(), Role::Server(_)));
    }

    #[test]
    fn reading_without_callback_is_unsupported() {
        let config = ChannelConfig::server(ProcessSpec::new("worker"));
        assert!(matches!(
            config.validate(),
            Err(ChannelError::UnsupportedConfiguration(_))
        ));

        let config = config.with_direction(Direction::Out);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_poll_interval_is_unsupported() {
        let config = ChannelConfig::server(ProcessSpec::new("worker"))
            .with_direction(Direction::In)
            .with_poll_interval(Duration::ZERO)
            .on_frame(|_| {});
        assert!(matches!(
            config.validate(),
            Err(ChannelError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn inherited_mode_client_rejects_handle_arguments() {
        let config = ChannelConfig::client(ClientHandles::new(Some("4".into()), None))
            .with_direction(Direction::Out)
            .with_connection_mode(ConnectionMode::InheritedHandles);
        assert!(matches!(
            config.validate(),
            Err(ChannelError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn debug_hides_callbacks() {
        let config = ChannelConfig::server(ProcessSpec::new("worker")).on_frame(|_| {});
        let rendered = format!("{config:?}");
        assert!(rendered.contains("<callback>"));
    }

    #[test]
    fn direction_serializes_lowercase() {
        let json = serde_json::to_string(&Direction::Bidirectional).unwrap();
        assert_eq!(json, "\"bidirectional\"");
        let mode: ConnectionMode = serde_json::from_str("\"inherited-handles\"").unwrap();
        assert_eq!(mode, ConnectionMode::InheritedHandles);
    }
}

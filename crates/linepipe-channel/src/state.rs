use serde::Serialize;

/// Channel lifecycle.
///
/// `Constructed -> Starting -> Running -> Stopped`. A failed start goes
/// straight to `Stopped`; a stopped channel is never restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Constructed,
    Starting,
    Running,
    Stopped,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Constructed => "constructed",
            ChannelState::Starting => "starting",
            ChannelState::Running => "running",
            ChannelState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a channel ended up `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    /// `stop()` or drop ended a healthy channel.
    Requested,
    /// The peer closed its end between frames.
    PeerClosed,
    /// Start, the poller or reaping the child failed; the error was returned.
    Failed,
}

impl StopCause {
    pub fn as_str(self) -> &'static str {
        match self {
            StopCause::Requested => "requested",
            StopCause::PeerClosed => "peer_closed",
            StopCause::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StopCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_serde() {
        for state in [
            ChannelState::Constructed,
            ChannelState::Starting,
            ChannelState::Running,
            ChannelState::Stopped,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
        for cause in [StopCause::Requested, StopCause::PeerClosed, StopCause::Failed] {
            let json = serde_json::to_string(&cause).unwrap();
            assert_eq!(json, format!("\"{cause}\""));
        }
    }
}

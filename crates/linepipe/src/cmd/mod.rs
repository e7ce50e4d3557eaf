use clap::{Args, Subcommand, ValueEnum};
use linepipe_channel::{ConnectionMode, Direction};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod host;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Spawn a child process, exchange frames with it and print what it sends.
    Host(HostArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Host(args) => host::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum DirectionArg {
    In,
    Out,
    Bidirectional,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::In => Direction::In,
            DirectionArg::Out => Direction::Out,
            DirectionArg::Bidirectional => Direction::Bidirectional,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Pass descriptor numbers as the child's first two arguments.
    CommandLineHandles,
    /// Wire the pipes to the child's stdin and stdout.
    InheritedHandles,
}

impl From<ModeArg> for ConnectionMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::CommandLineHandles => ConnectionMode::CommandLineHandles,
            ModeArg::InheritedHandles => ConnectionMode::InheritedHandles,
        }
    }
}

#[derive(Args, Debug)]
pub struct HostArgs {
    /// Program to spawn.
    pub program: String,
    /// Arguments for the program (after the two handle arguments in
    /// command-line-handles mode).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
    /// Which pipes to create, seen from this process.
    #[arg(long, value_enum, default_value = "bidirectional", env = "LINEPIPE_DIRECTION")]
    pub direction: DirectionArg,
    /// How the child receives its pipe ends.
    #[arg(long, value_enum, default_value = "command-line-handles", env = "LINEPIPE_MODE")]
    pub mode: ModeArg,
    /// Poll interval for the inbound pipe (e.g. 100ms, 1s).
    #[arg(long, default_value = "100ms", env = "LINEPIPE_POLL_INTERVAL")]
    pub interval: String,
    /// Time allowed between SYNC and END of one frame.
    #[arg(long, default_value = "5s", env = "LINEPIPE_FRAME_TIMEOUT")]
    pub frame_timeout: String,
    /// Time the child gets to exit on shutdown before it is killed.
    #[arg(long, default_value = "2s", env = "LINEPIPE_SHUTDOWN_GRACE")]
    pub grace: String,
    /// Send these lines to the child as one frame after start (repeatable).
    #[arg(long = "send", value_name = "LINE")]
    pub send: Vec<String>,
    /// Exit after receiving N frames.
    #[arg(long)]
    pub count: Option<u64>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

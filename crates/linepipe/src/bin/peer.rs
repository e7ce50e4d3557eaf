//! Client end of a linepipe channel.
//!
//! Spawned by `linepipe host` (or any [`linepipe::channel::Channel`] server)
//! with the two pipe handles as its first arguments. Attaches to them, emits
//! and/or echoes frames, and exits when the parent closes its pipe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use linepipe::channel::{
    Channel, ChannelConfig, ChannelError, ChannelState, ClientHandles, Direction,
};

use linepipe::cli::exit::{channel_error, CliError, CliResult, SUCCESS, USAGE};
use linepipe::cli::logging::{init_logging, LogFormat, LogLevel, LogRole};
use linepipe::cli::support::{install_ctrlc_handler, parse_duration};

const RECV_SLICE: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "linepipe-peer", version, about = "Client end of a linepipe channel")]
struct Cli {
    /// Handle of the pipe to read from the parent (`-` if none).
    in_handle: String,

    /// Handle of the pipe to write to the parent (`-` if none).
    out_handle: String,

    /// Send these lines as one frame right after attaching (repeatable).
    #[arg(long = "emit", value_name = "LINE")]
    emit: Vec<String>,

    /// Send every received frame back unchanged.
    #[arg(long)]
    echo: bool,

    /// Exit after receiving N frames.
    #[arg(long)]
    count: Option<u64>,

    /// Poll interval for the inbound pipe.
    #[arg(long, default_value = "20ms", env = "LINEPIPE_POLL_INTERVAL")]
    interval: String,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "warn",
        env = "LINEPIPE_LOG_LEVEL"
    )]
    log_level: LogLevel,
}

fn main() {
    let cli = Cli::parse();
    let _log_span = init_logging(cli.log_format, cli.log_level, LogRole::Peer);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

fn run(cli: Cli) -> CliResult<i32> {
    let handles = ClientHandles::new(Some(cli.in_handle.clone()), Some(cli.out_handle.clone()));
    let direction = direction_for(&handles, &cli)?;
    let interval = parse_duration(&cli.interval)?;

    let mut config = ChannelConfig::client(handles)
        .with_direction(direction)
        .with_poll_interval(interval);
    let frames = if direction.reads() {
        let (tx, rx) = mpsc::channel();
        config = config.on_frame(move |lines| {
            let _ = tx.send(lines);
        });
        Some(rx)
    } else {
        None
    };

    let mut channel = Channel::new(config);
    channel
        .start()
        .map_err(|err| channel_error("attach failed", err))?;
    tracing::info!(?direction, "attached to parent");

    if !cli.emit.is_empty() {
        channel
            .send(&cli.emit)
            .map_err(|err| channel_error("emit failed", err))?;
    }

    if let Some(frames) = frames {
        let running = Arc::new(AtomicBool::new(true));
        install_ctrlc_handler(running.clone())?;

        let mut received = 0u64;
        while running.load(Ordering::SeqCst) {
            match frames.recv_timeout(RECV_SLICE) {
                Ok(lines) => {
                    received = received.saturating_add(1);
                    tracing::info!(frame = received, lines = lines.len(), "received frame");
                    if cli.echo {
                        match channel.send(&lines) {
                            Ok(()) => {}
                            // Parent already closed our inbound pipe.
                            Err(ChannelError::InvalidState { .. }) => break,
                            Err(err) => return Err(channel_error("echo failed", err)),
                        }
                    }
                    if cli.count.is_some_and(|count| received >= count) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if channel.state() == ChannelState::Stopped {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    channel
        .stop()
        .map_err(|err| channel_error("channel stopped", err))?;
    Ok(SUCCESS)
}

fn direction_for(handles: &ClientHandles, cli: &Cli) -> CliResult<Direction> {
    let direction = match (handles.inbound().is_some(), handles.outbound().is_some()) {
        (true, true) => Direction::Bidirectional,
        (true, false) => Direction::In,
        (false, true) => Direction::Out,
        (false, false) => {
            return Err(CliError::new(
                USAGE,
                "at least one of IN_HANDLE and OUT_HANDLE is required",
            ))
        }
    };

    if cli.echo && direction != Direction::Bidirectional {
        return Err(CliError::new(USAGE, "--echo needs both handles"));
    }
    if !cli.emit.is_empty() && !direction.writes() {
        return Err(CliError::new(USAGE, "--emit needs OUT_HANDLE"));
    }
    Ok(direction)
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use linepipe_channel::{Channel, ChannelConfig, ChannelState, Direction, ProcessSpec};
use linepipe_frame::FrameConfig;

use crate::cmd::HostArgs;
use crate::exit::{channel_error, CliResult, SUCCESS};
use crate::output::{print_frame, OutputFormat};
use crate::support::{install_ctrlc_handler, parse_duration};

/// How long the receive loop blocks before re-checking Ctrl-C and channel state.
const RECV_SLICE: Duration = Duration::from_millis(50);

pub fn run(args: HostArgs, format: OutputFormat) -> CliResult<i32> {
    let (config, frames) = build_config(&args)?;
    let mut channel = Channel::new(config);
    channel
        .start()
        .map_err(|err| channel_error("start failed", err))?;
    tracing::info!(program = %args.program, pid = ?channel.child_id(), "child started");

    if !args.send.is_empty() {
        channel
            .send(&args.send)
            .map_err(|err| channel_error("send failed", err))?;
    }

    if let Some(frames) = frames {
        let running = Arc::new(AtomicBool::new(true));
        install_ctrlc_handler(running.clone())?;
        let received = receive(&channel, &frames, &running, args.count, format);
        tracing::debug!(received, "receive loop finished");
    }

    channel
        .stop()
        .map_err(|err| channel_error("channel stopped", err))?;
    if let Some(status) = channel.exit_status() {
        tracing::info!(%status, cause = ?channel.stop_cause(), "child exited");
    }

    Ok(SUCCESS)
}

type FrameReceiver = Receiver<Vec<String>>;

fn build_config(args: &HostArgs) -> CliResult<(ChannelConfig, Option<FrameReceiver>)> {
    let interval = parse_duration(&args.interval)?;
    let frame_timeout = parse_duration(&args.frame_timeout)?;
    let grace = parse_duration(&args.grace)?;
    let direction = Direction::from(args.direction);

    let process = ProcessSpec::new(&args.program).args(&args.args);
    let config = ChannelConfig::server(process)
        .with_direction(direction)
        .with_connection_mode(args.mode.into())
        .with_poll_interval(interval)
        .with_shutdown_grace(grace)
        .with_frame_config(FrameConfig {
            frame_timeout: Some(frame_timeout),
            ..FrameConfig::default()
        });

    if !direction.reads() {
        return Ok((config, None));
    }

    let (tx, rx) = mpsc::channel();
    let config = config.on_frame(move |lines| {
        // The receiver outlives the channel; a failed send means we are exiting.
        let _ = tx.send(lines);
    });
    Ok((config, Some(rx)))
}

fn receive(
    channel: &Channel,
    frames: &FrameReceiver,
    running: &AtomicBool,
    count: Option<u64>,
    format: OutputFormat,
) -> u64 {
    let mut printed = 0u64;

    while running.load(Ordering::SeqCst) {
        match frames.recv_timeout(RECV_SLICE) {
            Ok(lines) => {
                printed = printed.saturating_add(1);
                print_frame(&lines, printed, channel.child_id(), format);
                if count.is_some_and(|count| printed >= count) {
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

    printed
}

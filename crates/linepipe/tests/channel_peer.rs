#![cfg(all(unix, feature = "cli"))]

use std::sync::mpsc;
use std::time::Duration;

use linepipe::channel::{Channel, ChannelConfig, ChannelState, Direction, ProcessSpec};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn peer() -> ProcessSpec {
    ProcessSpec::new(env!("CARGO_BIN_EXE_linepipe-peer"))
}

fn collecting(config: ChannelConfig) -> (ChannelConfig, mpsc::Receiver<Vec<String>>) {
    let (tx, rx) = mpsc::channel();
    let config = config
        .with_poll_interval(Duration::from_millis(20))
        .on_frame(move |lines| {
            let _ = tx.send(lines);
        });
    (config, rx)
}

#[test]
fn bidirectional_round_trip_through_peer() {
    let (config, rx) = collecting(ChannelConfig::server(peer().arg("--echo")));
    let mut channel = Channel::new(config);
    channel.start().expect("channel should start");
    assert_eq!(channel.state(), ChannelState::Running);

    channel
        .send(&["one", "two", "SYNC inside a payload is passed through"])
        .expect("send should succeed");
    let echoed = rx.recv_timeout(RECV_TIMEOUT).expect("peer should echo");
    assert_eq!(echoed, vec!["one", "two", "SYNC inside a payload is passed through"]);

    channel.send(&["again"]).expect("second send should succeed");
    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).expect("second echo"),
        vec!["again"]
    );

    channel.stop().expect("peer should exit on end of stream");
    assert!(channel.exit_status().expect("child reaped").success());
}

#[test]
fn inbound_only_channel_receives_peer_emission() {
    let (config, rx) = collecting(
        ChannelConfig::server(peer().arg("--emit").arg("hi").arg("--emit").arg("there"))
            .with_direction(Direction::In),
    );
    let mut channel = Channel::new(config);
    channel.start().expect("channel should start");
    assert!(!channel.has_outbound());

    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).expect("peer should emit"),
        vec!["hi", "there"]
    );
    channel.wait().expect("peer closing its pipe is a clean end");
    assert!(channel.exit_status().expect("child reaped").success());
}

#[test]
fn outbound_only_channel_feeds_peer() {
    let config = ChannelConfig::server(peer().arg("--count").arg("1"))
        .with_direction(Direction::Out);
    let mut channel = Channel::new(config);
    channel.start().expect("channel should start");
    assert!(!channel.has_inbound());

    channel.send(&["for the peer"]).expect("send should succeed");
    channel.stop().expect("stop should succeed");
    assert!(channel.exit_status().expect("child reaped").success());
}

//! Child-process channel with polled message delivery.
//!
//! This is the "just works" layer. A [`Channel`] either spawns a child and
//! wires pipes to it (server role) or attaches to pipes inherited from its
//! parent (client role). Inbound frames are picked up by a [`Poller`] on a
//! fixed interval and handed to the configured callback; outbound frames are
//! written with [`Channel::send`].

#[cfg(unix)]
pub mod channel;
pub mod config;
pub mod error;
pub mod poller;
pub mod process;
pub mod state;

#[cfg(unix)]
pub use channel::Channel;
pub use config::{
    ChannelConfig, ClientHandles, ConnectionMode, DeliveryCallback, Direction, ErrorCallback,
    Role, DEFAULT_POLL_INTERVAL, DEFAULT_SHUTDOWN_GRACE,
};
pub use error::{ChannelError, Result};
pub use poller::Poller;
pub use process::{ProcessSpec, StdioPolicy};
pub use state::{ChannelState, StopCause};

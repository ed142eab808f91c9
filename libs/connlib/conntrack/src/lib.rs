//! Stateful tracking of TCP connections for the userspace firewall.
//!
//! The local host is trusted: every segment it sends is recorded and a SYN starts tracking a new connection.
//! Segments arriving from remote peers are only admitted if they continue a connection the local host opened,
//! according to the TCP state machine in [`tcp`].

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod error;
mod flags;
mod key;
mod metrics;
mod packet;
mod reaper;
mod table;
mod tracker;

pub mod tcp;

pub use config::{
    Config, DEFAULT_CLOSING_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_REAP_INTERVAL, DEFAULT_TCP_IDLE_TIMEOUT,
};
pub use error::Error;
pub use flags::TcpFlags;
pub use key::{ConnKey, Protocol};
pub use packet::Segment;
pub use table::ConnectionInfo;
pub use tcp::State;
pub use tracker::Tracker;

//! Socket abstractions routed through the daemon
//!
//! [`TorStream`] is the client side: a TCP stream reaching its destination
//! through the daemon's SOCKS proxy. [`HiddenServiceSocket`] is the server
//! side: a loopback listener published as an onion service. Both resolve
//! their instance explicitly or fall back to the process-wide default.

mod client;
mod server;

pub use client::{ConnectOptions, TorStream};
pub use server::HiddenServiceSocket;

use std::fmt;

/// Logical address of a connection endpoint inside the overlay network:
/// the service name and the onion-side port. Streams report this instead
/// of a raw IP because no meaningful IP exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenServiceAddr {
    pub destination: String,
    pub port: u16,
}

impl HiddenServiceAddr {
    pub fn new(destination: impl Into<String>, port: u16) -> Self {
        Self {
            destination: destination.into(),
            port,
        }
    }
}

impl fmt::Display for HiddenServiceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.destination, self.port)
    }
}

//! Error taxonomy
//!
//! Three error families, matching the three failure surfaces: starting the
//! daemon, connecting through its SOCKS proxy, and publishing services.

use std::io;
use std::process::ExitStatus;
use thiserror::Error;

/// Failures while installing, spawning, or authenticating to the daemon.
///
/// Every variant is fatal to that start attempt. The bootstrap path kills
/// the spawned process before returning one of these unless ownership was
/// already transferred to the control session.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to install support files: {0}")]
    Install(#[source] io::Error),

    #[error("failed to spawn tor process: {0}")]
    Spawn(#[source] io::Error),

    #[error("tor exited with {0}")]
    DaemonExited(ExitStatus),

    #[error("tor never announced its control port")]
    PortNotAnnounced,

    #[error("auth cookie not created")]
    CookieTimeout,

    #[error("control connection failed: {0}")]
    Control(#[source] io::Error),

    #[error("control authentication failed: {0}")]
    Auth(String),

    #[error("tor failed to bootstrap within {0} seconds")]
    BootstrapTimeout(u64),
}

/// Failures while connecting a client stream through the SOCKS proxy.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no tor instance configured")]
    NoInstance,

    #[error("socks proxy address unavailable: {0}")]
    Proxy(String),

    #[error("socks connect failed: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("cannot connect to {host}:{port} after {attempts} tries")]
    Exhausted {
        host: String,
        port: u16,
        attempts: u32,
    },
}

impl ConnectError {
    /// Whether this failure class is worth retrying after a short delay.
    ///
    /// Tor reports a not-yet-propagated onion descriptor as a host
    /// unreachable (or, for slow circuits, TTL expired) SOCKS reply; those
    /// resolve themselves once the descriptor lands. Everything else is
    /// permanent for the current attempt loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectError::Socks(tokio_socks::Error::HostUnreachable)
                | ConnectError::Socks(tokio_socks::Error::TtlExpired)
        )
    }
}

/// Failures while publishing or unpublishing a hidden service.
///
/// These are surfaced to the caller but never prevent local resource
/// release: a server socket close always drops its listener first.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no tor instance configured")]
    NoInstance,

    #[error("hidden service directive rejected: {0}")]
    Publish(#[source] io::Error),

    #[error("tor did not create the hostname file for '{0}'")]
    HostnameTimeout(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_retries_descriptor_lag_only() {
        let lag = ConnectError::Socks(tokio_socks::Error::HostUnreachable);
        let slow = ConnectError::Socks(tokio_socks::Error::TtlExpired);
        let refused = ConnectError::Socks(tokio_socks::Error::ConnectionRefused);
        let none = ConnectError::NoInstance;

        assert!(lag.is_transient());
        assert!(slow.is_transient());
        assert!(!refused.is_transient());
        assert!(!none.is_transient());
    }

    #[test]
    fn exhausted_message_names_the_attempt_count() {
        let err = ConnectError::Exhausted {
            host: "example.onion".into(),
            port: 80,
            attempts: 5,
        };
        assert_eq!(
            err.to_string(),
            "cannot connect to example.onion:80 after 5 tries"
        );
    }
}

//! torbind library crate
//!
//! Runs a Tor daemon as a supervised child process and exposes socket
//! types routed through it.
//!
//! # Modules
//!
//! - [`install`] - Working-directory layout and support-file installation
//! - [`process`] - Daemon spawn, control-port discovery, cookie observer
//! - [`tor`] - Instance facade, control session, event routing
//! - [`socket`] - Hidden-service server sockets and SOCKS client streams
//! - [`error`] - Typed failure taxonomy
//! - [`logging`] - Tracing setup
//!
//! # Usage
//!
//! ```no_run
//! use torbind::{HiddenServiceSocket, Tor, TorStream};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! // Bootstrapping takes a while; the default instance backs every
//! // socket created without an explicit one.
//! let tor = Tor::set_default(Tor::start("tor-demo").await?);
//!
//! let service = HiddenServiceSocket::open(10024, "test").await?;
//! service.add_ready_listener(|socket| {
//!     println!("hidden service {} is reachable", socket.service_name());
//! });
//!
//! let stream = TorStream::connect(service.service_name(), 10024).await?;
//! # let _ = (tor, stream);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)] // Format string style preference
#![allow(clippy::module_name_repetitions)] // Public names read better qualified

pub mod error;
pub mod install;
pub mod logging;
pub mod process;
pub mod socket;
pub mod tor;

pub use error::{BootstrapError, ConnectError, RegistryError};
pub use socket::{ConnectOptions, HiddenServiceAddr, HiddenServiceSocket, TorStream};
pub use tor::{ControlSession, EventRouter, Tor};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Hidden-service server socket
//!
//! Publishes an onion service and accepts its inbound connections on a
//! plain loopback listener; the daemon forwards onion traffic there, so
//! the overlay routing is invisible to the accept side.

use crate::error::RegistryError;
use crate::socket::HiddenServiceAddr;
use crate::tor::Tor;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::debug;

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "hidden service socket closed")
}

/// A published hidden service bound to a local listener.
///
/// Cheap to clone; clones share the listener and the published service.
#[derive(Clone)]
pub struct HiddenServiceSocket {
    inner: Arc<Inner>,
}

struct Inner {
    service_name: String,
    dir_name: String,
    local_port: u16,
    service_port: u16,
    tor: Arc<Tor>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    closed: Notify,
}

impl HiddenServiceSocket {
    /// Publish a hidden service exposing `local_port` under the same port
    /// number on the onion side, using the default instance. Keys live in
    /// the working directory's subdirectory named `dir_name`.
    pub async fn open(local_port: u16, dir_name: &str) -> Result<Self, RegistryError> {
        Self::open_with(local_port, dir_name, local_port, None).await
    }

    /// Publish with an explicit onion-side port and/or instance.
    pub async fn open_with(
        local_port: u16,
        dir_name: &str,
        service_port: u16,
        tor: Option<Arc<Tor>>,
    ) -> Result<Self, RegistryError> {
        let tor = tor
            .or_else(Tor::default_instance)
            .ok_or(RegistryError::NoInstance)?;

        let service_name = tor
            .publish_hidden_service(dir_name, service_port, local_port)
            .await?;

        let listener = match TcpListener::bind(("127.0.0.1", local_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                // Withdraw the directive; nothing will ever answer it.
                if let Err(undo) = tor.unpublish_hidden_service(dir_name).await {
                    debug!("unpublish after failed bind: {}", undo);
                }
                return Err(RegistryError::Io(e));
            },
        };

        let socket = Self {
            inner: Arc::new(Inner {
                service_name: service_name.clone(),
                dir_name: dir_name.to_string(),
                local_port,
                service_port,
                tor: Arc::clone(&tor),
                listener: Mutex::new(Some(Arc::new(listener))),
                closed: Notify::new(),
            }),
        };

        // From here on the upload confirmation can find its socket.
        tor.router().registry().attach(&service_name, socket.clone());

        Ok(socket)
    }

    /// The generated onion address of this service.
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    pub fn service_port(&self) -> u16 {
        self.inner.service_port
    }

    /// The logical address clients reach this service under.
    pub fn socket_addr(&self) -> HiddenServiceAddr {
        HiddenServiceAddr::new(self.inner.service_name.clone(), self.inner.service_port)
    }

    /// Run `listener` once the service's descriptor has been uploaded and
    /// the service is reachable. May be called before or after that point;
    /// each registered listener fires exactly once, on the event task, so
    /// it must be short and non-blocking.
    pub fn add_ready_listener(&self, listener: impl FnOnce(HiddenServiceSocket) + Send + 'static) {
        self.inner
            .tor
            .router()
            .registry()
            .add_listener(&self.inner.service_name, Box::new(listener));
    }

    /// Accept one inbound connection. Unblocked by [`close`](Self::close).
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let listener = self
            .inner
            .listener
            .lock()
            .expect("listener slot")
            .clone()
            .ok_or_else(closed_err)?;

        let notified = self.inner.closed.notified();
        tokio::pin!(notified);
        // Register interest before re-checking, so a close racing this
        // accept cannot slip between the check and the wait.
        notified.as_mut().enable();
        if self.inner.listener.lock().expect("listener slot").is_none() {
            return Err(closed_err());
        }

        tokio::select! {
            result = listener.accept() => result,
            _ = &mut notified => Err(closed_err()),
        }
    }

    /// Close the local listener and withdraw the service.
    ///
    /// The listener is always released, even when the unpublish command
    /// fails; that failure is surfaced as an I/O error.
    pub async fn close(&self) -> io::Result<()> {
        let released = self.inner.listener.lock().expect("listener slot").take();
        self.inner.closed.notify_waiters();
        if released.is_some() {
            debug!("closing hidden service {}", self.inner.service_name);
        }

        self.inner
            .tor
            .unpublish_hidden_service(&self.inner.dir_name)
            .await
            .map_err(io::Error::other)
    }
}

impl std::fmt::Debug for HiddenServiceSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HiddenServiceSocket")
            .field("service_name", &self.inner.service_name)
            .field("service_port", &self.inner.service_port)
            .field("local_port", &self.inner.local_port)
            .finish()
    }
}

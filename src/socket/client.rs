//! Client streams through the SOCKS proxy
//!
//! Connecting to a just-published onion service races descriptor
//! propagation: the proxy answers "host unreachable" until the directory
//! servers have the descriptor. The connect path retries exactly that
//! failure class on a fixed cadence and aborts immediately on everything
//! else.

use crate::error::ConnectError;
use crate::socket::HiddenServiceAddr;
use crate::tor::Tor;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

/// Pause between connect attempts while a descriptor propagates.
const RETRY_SLEEP: Duration = Duration::from_millis(500);

const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Tuning for [`TorStream::connect_with`].
pub struct ConnectOptions {
    /// Stream-isolation token: connections carrying different tokens are
    /// guaranteed not to share a circuit. Forwarded to the proxy as SOCKS
    /// credentials.
    pub stream_token: Option<String>,
    /// Connect attempts before giving up; at least one.
    pub max_attempts: u32,
    /// Explicit instance; the process default when absent.
    pub tor: Option<Arc<Tor>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            stream_token: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            tor: None,
        }
    }
}

/// A connected stream routed through the overlay network.
///
/// A thin facade over the underlying transport: every I/O and socket
/// operation delegates to the inner [`TcpStream`]; only the remote address
/// is the logical (destination, port) pair.
pub struct TorStream {
    stream: TcpStream,
    remote: HiddenServiceAddr,
}

impl TorStream {
    /// Connect to `destination:port` through the default instance.
    pub async fn connect(destination: &str, port: u16) -> Result<Self, ConnectError> {
        Self::connect_with(destination, port, ConnectOptions::default()).await
    }

    /// Connect with explicit options. `destination` is an onion address or
    /// a regular hostname (resolved by the exit, never locally).
    pub async fn connect_with(
        destination: &str,
        port: u16,
        options: ConnectOptions,
    ) -> Result<Self, ConnectError> {
        let tor = options
            .tor
            .or_else(Tor::default_instance)
            .ok_or(ConnectError::NoInstance)?;
        let proxy = tor.proxy_addr();
        let max_attempts = options.max_attempts.max(1);
        let token = options.stream_token;

        let started = std::time::Instant::now();
        let stream = retrying(max_attempts, |attempt| {
            let token = token.clone();
            async move {
                debug!(
                    "connect attempt {}/{} to {}:{}",
                    attempt, max_attempts, destination, port
                );
                socks_connect(proxy, destination, port, token.as_deref())
                    .await
                    .map_err(ConnectError::from)
            }
        })
        .await
        .map_err(|failure| match failure {
            RetryFailure::Fatal(e) => e,
            RetryFailure::Exhausted => ConnectError::Exhausted {
                host: destination.to_string(),
                port,
                attempts: max_attempts,
            },
        })?;

        debug!(
            "connected to {}:{} in {}ms",
            destination,
            port,
            started.elapsed().as_millis()
        );
        stream
            .set_nodelay(true)
            .map_err(|e| ConnectError::Socks(tokio_socks::Error::Io(e)))?;

        Ok(Self {
            stream,
            remote: HiddenServiceAddr::new(destination, port),
        })
    }

    /// The logical remote address (service name and onion-side port).
    pub fn remote_addr(&self) -> &HiddenServiceAddr {
        &self.remote
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        self.stream.nodelay()
    }

    pub fn set_linger(&self, dur: Option<Duration>) -> io::Result<()> {
        self.stream.set_linger(dur)
    }

    pub fn linger(&self) -> io::Result<Option<Duration>> {
        self.stream.linger()
    }

    pub fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        self.stream.set_ttl(ttl)
    }

    pub fn ttl(&self) -> io::Result<u32> {
        self.stream.ttl()
    }

    /// Shut down the write half, signalling EOF to the peer while reads
    /// stay usable.
    pub async fn shutdown_write(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Split into owned read and write halves.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }

    /// Unwrap the underlying transport.
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

impl std::fmt::Debug for TorStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorStream")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for TorStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TorStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// One SOCKS-layered connect. A token becomes the proxy credentials, which
/// is how the daemon scopes circuits to isolation groups.
async fn socks_connect(
    proxy: SocketAddr,
    destination: &str,
    port: u16,
    token: Option<&str>,
) -> Result<TcpStream, tokio_socks::Error> {
    let stream = match token {
        Some(token) => {
            Socks5Stream::connect_with_password(proxy, (destination, port), token, token).await?
        },
        None => Socks5Stream::connect(proxy, (destination, port)).await?,
    };
    Ok(stream.into_inner())
}

enum RetryFailure {
    Fatal(ConnectError),
    Exhausted,
}

/// Drive `attempt` up to `max_attempts` times, sleeping [`RETRY_SLEEP`]
/// between attempts. Only failures classified transient are retried.
async fn retrying<T, F, Fut>(max_attempts: u32, mut attempt: F) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ConnectError>>,
{
    for i in 1..=max_attempts {
        match attempt(i).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                debug!("attempt {} failed ({}), retrying", i, e);
                if i < max_attempts {
                    tokio::time::sleep(RETRY_SLEEP).await;
                }
            },
            Err(e) => return Err(RetryFailure::Fatal(e)),
        }
    }
    Err(RetryFailure::Exhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> ConnectError {
        ConnectError::Socks(tokio_socks::Error::HostUnreachable)
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_makes_exactly_n_spaced_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = retrying(5, |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        assert!(matches!(result, Err(RetryFailure::Exhausted)));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // Four gaps of at least the retry pause between five attempts.
        assert!(started.elapsed() >= Duration::from_millis(4 * 500));
    }

    #[tokio::test(start_paused = true)]
    async fn success_stops_the_attempt_loop() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let result = retrying(3, |attempt| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert!(matches!(result, Ok(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_abort_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = retrying(5, |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConnectError::Socks(tokio_socks::Error::ConnectionRefused))
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryFailure::Fatal(ConnectError::Socks(
                tokio_socks::Error::ConnectionRefused
            )))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

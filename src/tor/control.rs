//! Control-port session
//!
//! Communicates with the supervised daemon over its control connection.
//! The read half lives in a background task that splits the stream into
//! asynchronous `650` events (handed to the [`EventRouter`]) and command
//! replies (handed back to the in-flight command). Commands are serialized:
//! one command is on the wire at a time.
//!
//! The session owns the transport socket. Once `TAKEOWNERSHIP` has been
//! acknowledged, closing the transport is the authoritative signal for the
//! daemon to exit.

use crate::tor::events::EventRouter;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

/// Upper bound on waiting for a single command reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// One complete control-protocol reply.
#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub lines: Vec<String>,
}

impl Reply {
    fn is_ok(&self) -> bool {
        self.status / 100 == 2
    }
}

struct CommandLink {
    writer: OwnedWriteHalf,
    replies: mpsc::Receiver<Reply>,
}

/// Authenticated connection to the daemon's control port.
pub struct ControlSession {
    link: Mutex<Option<CommandLink>>,
    owned: AtomicBool,
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "control session closed")
}

impl ControlSession {
    /// Take over a freshly-connected control socket. Spawns the reader
    /// task; the caller still has to authenticate.
    pub fn open(stream: TcpStream, router: Arc<EventRouter>) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (reply_tx, reply_rx) = mpsc::channel(8);
        tokio::spawn(read_loop(read_half, reply_tx, router));

        Self {
            link: Mutex::new(Some(CommandLink {
                writer: write_half,
                replies: reply_rx,
            })),
            owned: AtomicBool::new(false),
        }
    }

    /// Send one command line and wait for its reply.
    async fn send_command(&self, command: &str) -> io::Result<Reply> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or_else(closed_err)?;

        // The cookie hex is a credential; log only the verb.
        let verb = command.split(' ').next().unwrap_or(command);
        debug!("sending {}", verb);

        link.writer.write_all(command.as_bytes()).await?;
        link.writer.write_all(b"\r\n").await?;
        link.writer.flush().await?;

        let reply = tokio::time::timeout(REPLY_TIMEOUT, link.replies.recv())
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "timeout waiting for control reply")
            })?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "control connection closed",
                )
            })?;

        if !reply.is_ok() {
            let detail = reply.lines.last().cloned().unwrap_or_default();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("tor control error: {}", detail.trim()),
            ));
        }
        Ok(reply)
    }

    /// Authenticate with the contents of the auth cookie file.
    pub async fn authenticate(&self, cookie: &[u8]) -> io::Result<()> {
        let hex = data_encoding::HEXLOWER.encode(cookie);
        self.send_command(&format!("AUTHENTICATE {}", hex)).await?;
        Ok(())
    }

    /// Tell the daemon to exit when this control connection closes.
    pub async fn take_ownership(&self) -> io::Result<()> {
        self.send_command("TAKEOWNERSHIP").await?;
        self.owned.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Whether ownership has been transferred to this session.
    pub fn is_owned(&self) -> bool {
        self.owned.load(Ordering::SeqCst)
    }

    pub async fn reset_conf(&self, key: &str) -> io::Result<()> {
        self.send_command(&format!("RESETCONF {}", key)).await?;
        Ok(())
    }

    pub async fn set_conf(&self, key: &str, value: &str) -> io::Result<()> {
        self.send_command(&format!("SETCONF {}={}", key, value))
            .await?;
        Ok(())
    }

    /// Set several configuration values in one transaction. Values are
    /// quoted, so they may contain spaces.
    pub async fn set_conf_pairs(&self, pairs: &[(String, String)]) -> io::Result<()> {
        let mut command = String::from("SETCONF");
        for (key, value) in pairs {
            command.push(' ');
            command.push_str(key);
            command.push_str("=\"");
            command.push_str(value);
            command.push('"');
        }
        self.send_command(&command).await?;
        Ok(())
    }

    /// Subscribe to the given asynchronous event types, replacing any
    /// previous subscription.
    pub async fn set_events(&self, events: &[&str]) -> io::Result<()> {
        self.send_command(&format!("SETEVENTS {}", events.join(" ")))
            .await?;
        Ok(())
    }

    /// Fetch a single GETINFO value.
    pub async fn get_info(&self, key: &str) -> io::Result<String> {
        let reply = self.send_command(&format!("GETINFO {}", key)).await?;
        extract_info(&reply, key).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("GETINFO reply missing {}", key),
            )
        })
    }

    /// Whether the daemon reports a completed bootstrap.
    pub async fn bootstrapped(&self) -> io::Result<bool> {
        Ok(self
            .get_info("status/bootstrap-phase")
            .await?
            .contains("PROGRESS=100"))
    }

    pub async fn enable_network(&self) -> io::Result<()> {
        self.set_conf("DisableNetwork", "0").await
    }

    pub async fn signal(&self, signal: &str) -> io::Result<()> {
        self.send_command(&format!("SIGNAL {}", signal)).await?;
        Ok(())
    }

    /// Stop the daemon: disable networking, ask it to terminate, close the
    /// transport. A second call fails with a clean "session closed" error.
    pub async fn shutdown(&self) -> io::Result<()> {
        if self.link.lock().await.is_none() {
            return Err(closed_err());
        }
        debug!("stopping tor");
        if let Err(e) = self.set_conf("DisableNetwork", "1").await {
            debug!("disable network during shutdown: {}", e);
        }
        // The daemon may drop the connection before acknowledging.
        if let Err(e) = self.signal("TERM").await {
            debug!("shutdown signal: {}", e);
        }
        self.close().await;
        Ok(())
    }

    /// Close the transport. With ownership taken this alone terminates the
    /// daemon. Idempotent.
    pub async fn close(&self) {
        let _ = self.link.lock().await.take();
    }

    /// Whether the transport is still open.
    pub async fn is_open(&self) -> bool {
        self.link.lock().await.is_some()
    }
}

/// Reader task: classifies incoming lines into asynchronous events and
/// command replies. Dropping the reply sender unblocks a waiting command
/// with a "connection closed" error.
async fn read_loop(
    read_half: OwnedReadHalf,
    reply_tx: mpsc::Sender<Reply>,
    router: Arc<EventRouter>,
) {
    let mut lines = BufReader::new(read_half).lines();
    let mut pending: Vec<String> = Vec::new();
    let mut in_data_block = false;
    let mut in_event_data = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("control connection read failed: {}", e);
                break;
            },
        };

        if in_event_data {
            if line == "." {
                in_event_data = false;
            }
            continue;
        }
        if in_data_block {
            if line == "." {
                in_data_block = false;
            } else {
                pending.push(line);
            }
            continue;
        }

        // Asynchronous events never interleave inside a reply.
        if pending.is_empty() && line.starts_with("650") {
            if let Some(payload) = line.strip_prefix("650 ") {
                router.dispatch(payload);
            } else if line.starts_with("650+") {
                // Streamed event payload nobody consumes; swallow it so it
                // cannot masquerade as reply lines.
                in_event_data = true;
            }
            continue;
        }

        match classify(&line) {
            LineKind::Data => {
                in_data_block = true;
                pending.push(line);
            },
            LineKind::Continuation => pending.push(line),
            LineKind::Final(status) => {
                pending.push(line);
                let reply = Reply {
                    status,
                    lines: std::mem::take(&mut pending),
                };
                if reply_tx.send(reply).await.is_err() {
                    break;
                }
            },
        }
    }
    debug!("control connection reader finished");
}

enum LineKind {
    Continuation,
    Data,
    Final(u16),
}

/// Classify one reply line by its status-code separator: `-` continues,
/// `+` opens a data block, a space ends the reply.
fn classify(line: &str) -> LineKind {
    let bytes = line.as_bytes();
    if bytes.len() >= 4 && bytes[..3].iter().all(u8::is_ascii_digit) {
        match bytes[3] {
            b'+' => return LineKind::Data,
            b' ' => return LineKind::Final(line[..3].parse().unwrap_or(0)),
            _ => return LineKind::Continuation,
        }
    }
    LineKind::Continuation
}

/// Pull `key`'s value out of a GETINFO reply. Single-line values have the
/// form `250-key=value`; data-block values (`250+key=`) span the following
/// lines up to the closing `250 OK`.
fn extract_info(reply: &Reply, key: &str) -> Option<String> {
    let prefix = format!("{}=", key);
    for (i, raw) in reply.lines.iter().enumerate() {
        let line = raw
            .strip_prefix("250-")
            .or_else(|| raw.strip_prefix("250+"))
            .unwrap_or(raw);
        if let Some(value) = line.strip_prefix(&prefix) {
            if raw.starts_with("250+") {
                let end = reply.lines.len().saturating_sub(1);
                return Some(reply.lines[i + 1..end].join("\n"));
            }
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn reply(lines: &[&str]) -> Reply {
        let status = lines
            .last()
            .and_then(|l| l.get(..3))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Reply {
            status,
            lines: lines.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn classifies_reply_lines() {
        assert!(matches!(classify("250 OK"), LineKind::Final(250)));
        assert!(matches!(classify("551 oops"), LineKind::Final(551)));
        assert!(matches!(classify("250-version=1"), LineKind::Continuation));
        assert!(matches!(classify("250+orconn-status="), LineKind::Data));
        assert!(matches!(classify("junk"), LineKind::Continuation));
    }

    #[test]
    fn extracts_single_line_info_value() {
        let r = reply(&[
            "250-net/listeners/socks=\"127.0.0.1:9050\"",
            "250 OK",
        ]);
        assert_eq!(
            extract_info(&r, "net/listeners/socks").as_deref(),
            Some("127.0.0.1:9050")
        );
    }

    #[test]
    fn extracts_data_block_info_value() {
        let r = reply(&[
            "250+orconn-status=",
            "$AAAA~relay CONNECTED",
            "$BBBB~other CONNECTED",
            "250 OK",
        ]);
        assert_eq!(
            extract_info(&r, "orconn-status").as_deref(),
            Some("$AAAA~relay CONNECTED\n$BBBB~other CONNECTED")
        );
    }

    #[test]
    fn missing_key_yields_none() {
        let r = reply(&["250 OK"]);
        assert_eq!(extract_info(&r, "version"), None);
    }

    /// A control-port stand-in acknowledging every command with `250 OK`.
    async fn spawn_ok_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                if write.write_all(b"250 OK\r\n").await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    async fn connect_session(addr: std::net::SocketAddr) -> ControlSession {
        let stream = TcpStream::connect(addr).await.unwrap();
        ControlSession::open(stream, Arc::new(EventRouter::new()))
    }

    #[tokio::test]
    async fn second_shutdown_fails_cleanly() {
        let session = connect_session(spawn_ok_server().await).await;

        session.shutdown().await.unwrap();
        assert!(!session.is_open().await);

        let err = session.shutdown().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn commands_fail_after_close() {
        let session = connect_session(spawn_ok_server().await).await;

        session.set_conf("DisableNetwork", "1").await.unwrap();
        session.close().await;

        let err = session.get_info("version").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn events_do_not_disturb_a_pending_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            // An asynchronous event lands between the command and its reply.
            let _ = lines.next_line().await;
            write
                .write_all(b"650 CIRC 1 BUILT\r\n250-version=0.4.8.12\r\n250 OK\r\n")
                .await
                .unwrap();
        });

        let session = connect_session(addr).await;
        assert_eq!(session.get_info("version").await.unwrap(), "0.4.8.12");
    }

    #[tokio::test]
    async fn error_replies_surface_their_detail() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let _ = lines.next_line().await;
            write
                .write_all(b"515 Authentication failed: Wrong length\r\n")
                .await
                .unwrap();
        });

        let session = connect_session(addr).await;
        let err = session.authenticate(b"not-the-cookie").await.unwrap_err();
        assert!(err.to_string().contains("Authentication failed"));
    }
}

//! Daemon process bootstrap
//!
//! Spawns the tor executable and supervises its startup: dedicated readers
//! for stdout (control-port discovery) and stderr (log forwarding), the
//! platform-specific wait semantics, and the auth-cookie write observer.

pub mod watch;

use crate::error::BootstrapError;
use crate::install::WorkDir;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Stdout line announcing the dynamically-assigned control port.
const PORT_ANNOUNCEMENT: &str = "Control listener listening on port ";

/// Config directive naming the process allowed to own the daemon.
pub const OWNER_DIRECTIVE: &str = "__OwningControllerProcess";

/// How long tor gets to create or update the auth cookie.
pub const COOKIE_TIMEOUT: Duration = Duration::from_millis(3000);

/// A spawned daemon whose control-port announcement may still be pending.
pub struct SpawnedDaemon {
    /// Present only where the process stays in the foreground (Windows);
    /// elsewhere the launcher has already exited after daemonizing.
    child: Option<Child>,
    port_rx: oneshot::Receiver<u16>,
}

impl SpawnedDaemon {
    /// Wait for the control-port announcement. Needs no extra timeout: if
    /// stdout closes without the announcement the scanner drops its sender
    /// and this resolves to an error.
    pub async fn control_port(&mut self) -> Result<u16, BootstrapError> {
        (&mut self.port_rx)
            .await
            .map_err(|_| BootstrapError::PortNotAnnounced)
    }

    /// Detach and return the retained foreground process handle, if any.
    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    /// Kill the retained foreground process, if any. Used on bootstrap
    /// failure before ownership is transferred to the control session.
    pub async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill().await {
                warn!("failed to kill tor process: {}", e);
            }
        }
        self.child = None;
    }
}

/// Extract the port number from the announcement line.
///
/// The line ends with the port followed by a period, e.g.
/// `... Control listener listening on port 36271.`
fn parse_control_port(line: &str) -> Option<u16> {
    let tail = line.rsplit(' ').next()?;
    tail.trim_end_matches('.').parse().ok()
}

/// Spawn the daemon with its stdout scanner and stderr forwarder attached.
///
/// On non-Windows platforms the launcher process daemonizes; its exit is
/// awaited and a nonzero status is a bootstrap failure. The caller is
/// responsible for killing a retained child if the rest of the bootstrap
/// fails.
pub async fn launch(workdir: &WorkDir) -> Result<SpawnedDaemon, BootstrapError> {
    let exe = workdir.executable();
    let pid = std::process::id().to_string();

    debug!("starting {} in {}", exe.display(), workdir.root().display());
    let mut command = Command::new(&exe);
    command
        .arg("-f")
        .arg(workdir.torrc())
        .arg(OWNER_DIRECTIVE)
        .arg(&pid)
        .current_dir(workdir.root())
        .env("HOME", workdir.root())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if cfg!(target_os = "linux") {
        // Linux does not search the current directory for shared
        // libraries, so a bundled tor needs the hint.
        command.env("LD_LIBRARY_PATH", workdir.root());
    }

    let mut child = command.spawn().map_err(BootstrapError::Spawn)?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let (port_tx, port_rx) = oneshot::channel::<u16>();
    tokio::spawn(scan_stdout(stdout, port_tx));
    tokio::spawn(forward_stderr(stderr));

    // Everywhere but Windows the process forks into the background; wait
    // for the launcher to go away and treat a bad status as fatal. On
    // Windows the process persists in the foreground, so keep the handle
    // and detect failures later through the control connection.
    let child = if cfg!(windows) {
        Some(child)
    } else {
        let status = child.wait().await.map_err(BootstrapError::Spawn)?;
        if !status.success() {
            return Err(BootstrapError::DaemonExited(status));
        }
        None
    };

    Ok(SpawnedDaemon { child, port_rx })
}

/// Read stdout line by line until the control-port announcement, then keep
/// draining so the daemon never blocks on a full pipe.
async fn scan_stdout(stdout: tokio::process::ChildStdout, port_tx: oneshot::Sender<u16>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut port_tx = Some(port_tx);
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("tor: {}", line);
        if line.contains(PORT_ANNOUNCEMENT) {
            if let Some(port) = parse_control_port(&line) {
                if let Some(tx) = port_tx.take() {
                    let _ = tx.send(port);
                }
            }
        }
    }
}

async fn forward_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!("tor: {}", line);
    }
}

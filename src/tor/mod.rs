//! Daemon lifecycle facade
//!
//! A [`Tor`] value is one supervised daemon: its working directory, its
//! authenticated control session, the event router, and the table of
//! currently-published hidden services. At most one instance is the
//! process-wide default; the socket types fall back to it when no instance
//! is passed explicitly.

pub mod control;
pub mod events;

pub use control::ControlSession;
pub use events::EventRouter;

use crate::error::{BootstrapError, RegistryError};
use crate::install::{self, BundledResources, WorkDir};
use crate::process::{self, watch::WriteObserver};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Event types every session subscribes to.
const EVENTS: &[&str] = &["CIRC", "WARN", "ERR"];
/// Event set once at least one hidden service has been published.
const EVENTS_WITH_HS_DESC: &[&str] = &["CIRC", "WARN", "ERR", "HS_DESC"];

const BOOTSTRAP_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const BOOTSTRAP_MAX_CHECKS: u32 = 48;

/// How long tor gets to generate a fresh service's hostname file.
const HOSTNAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between asking the daemon to exit and sweeping its files.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

static DEFAULT_INSTANCE: RwLock<Option<Arc<Tor>>> = RwLock::new(None);

struct PublishedService {
    dir: PathBuf,
    service_port: u16,
    local_port: u16,
    service_name: String,
}

/// One running, authenticated daemon instance.
pub struct Tor {
    workdir: WorkDir,
    control: ControlSession,
    router: Arc<EventRouter>,
    socks_addr: SocketAddr,
    services: Mutex<HashMap<String, PublishedService>>,
    // Foreground process handle (Windows only); elsewhere the launcher has
    // already exited and the owner directive ties the daemon to us.
    _child: Mutex<Option<Child>>,
}

impl Tor {
    /// Install support files into `dir`, start the daemon, and drive it to
    /// a fully-bootstrapped state. Blocks until the network is usable.
    pub async fn start(dir: impl AsRef<Path>) -> Result<Self, BootstrapError> {
        Self::start_with(dir, Vec::new()).await
    }

    /// Like [`Tor::start`], with bridge lines (as obtained from
    /// bridges.torproject.org) appended to the configuration.
    pub async fn start_with(
        dir: impl AsRef<Path>,
        bridges: Vec<String>,
    ) -> Result<Self, BootstrapError> {
        let workdir = WorkDir::new(dir.as_ref());

        install::install_files(&workdir, &BundledResources)
            .await
            .map_err(BootstrapError::Install)?;
        // The daemon resolves its `-f` argument and config paths against
        // its own working directory, so everything must be absolute.
        let workdir = WorkDir::new(
            tokio::fs::canonicalize(workdir.root())
                .await
                .map_err(BootstrapError::Install)?,
        );
        install::append_config(&workdir, &bridges)
            .await
            .map_err(BootstrapError::Install)?;
        install::precreate_cookie(&workdir)
            .await
            .map_err(BootstrapError::Install)?;

        // The observer must exist before the daemon does, or the cookie
        // write could slip past unseen.
        let cookie_observer =
            WriteObserver::new(&workdir.cookie_file()).map_err(BootstrapError::Install)?;

        info!("starting tor in {}", workdir.root().display());
        let mut daemon = process::launch(&workdir).await?;

        let router = Arc::new(EventRouter::new());
        let control =
            match open_session(&workdir, cookie_observer, &mut daemon, Arc::clone(&router)).await {
                Ok(control) => control,
                Err(e) => {
                    // Ownership was never taken; the spawned process would
                    // outlive us as a zombie otherwise.
                    daemon.kill().await;
                    return Err(e);
                },
            };

        let socks_addr = match finish_bootstrap(&control).await {
            Ok(addr) => addr,
            Err(e) => {
                // With ownership taken, closing the transport tells the
                // daemon to exit; a kill is only needed when it was never
                // transferred.
                control.close().await;
                if !control.is_owned() {
                    daemon.kill().await;
                }
                return Err(e);
            },
        };

        info!("tor bootstrapped, socks proxy at {}", socks_addr);
        Ok(Self {
            workdir,
            control,
            router,
            socks_addr,
            services: Mutex::new(HashMap::new()),
            _child: Mutex::new(daemon.take_child()),
        })
    }

    /// Install this instance as the process-wide default consulted by the
    /// socket types. Last write wins.
    pub fn set_default(tor: Tor) -> Arc<Tor> {
        let tor = Arc::new(tor);
        *DEFAULT_INSTANCE.write().expect("default slot") = Some(Arc::clone(&tor));
        tor
    }

    /// The current default instance, if one was set.
    pub fn default_instance() -> Option<Arc<Tor>> {
        DEFAULT_INSTANCE.read().expect("default slot").clone()
    }

    /// Clear the default-instance slot.
    pub fn clear_default() {
        *DEFAULT_INSTANCE.write().expect("default slot") = None;
    }

    /// Address of the daemon's SOCKS listener.
    pub fn proxy_addr(&self) -> SocketAddr {
        self.socks_addr
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.workdir
    }

    pub(crate) fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Publish a hidden service mapping `service_port` on the onion side
    /// to `local_port` on loopback. Keys live in (and are reused from) the
    /// working directory's subdirectory named `dir_name`. Returns the
    /// service name (the generated onion address).
    pub(crate) async fn publish_hidden_service(
        &self,
        dir_name: &str,
        service_port: u16,
        local_port: u16,
    ) -> Result<String, RegistryError> {
        // Descriptor-upload confirmations are only needed once services
        // exist; replace the base subscription.
        self.control
            .set_events(EVENTS_WITH_HS_DESC)
            .await
            .map_err(RegistryError::Publish)?;

        let hs_dir = self.workdir.hidden_service_dir(dir_name);
        tokio::fs::create_dir_all(&hs_dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&hs_dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        let hostname_file = self.workdir.hostname_file(dir_name);
        let observer = WriteObserver::new(&hostname_file).ok();

        let pairs = {
            let mut services = self.services.lock().expect("service table");
            services.insert(
                dir_name.to_string(),
                PublishedService {
                    dir: hs_dir.clone(),
                    service_port,
                    local_port,
                    service_name: String::new(),
                },
            );
            directive_pairs(&services)
        };
        if let Err(e) = self.control.set_conf_pairs(&pairs).await {
            // Roll the table back so a rejected directive leaves no ghost.
            self.services
                .lock()
                .expect("service table")
                .remove(dir_name);
            return Err(RegistryError::Publish(e));
        }

        let service_name = match self.read_hostname(dir_name, &hostname_file, observer).await {
            Ok(name) => name,
            Err(e) => {
                // Withdraw the directive so no half-published service stays
                // behind.
                if let Err(undo) = self.unpublish_hidden_service(dir_name).await {
                    warn!("rollback after failed publish: {}", undo);
                }
                return Err(e);
            },
        };
        debug!("hidden service {} -> {}", dir_name, service_name);

        if let Some(service) = self
            .services
            .lock()
            .expect("service table")
            .get_mut(dir_name)
        {
            service.service_name = service_name.clone();
        }
        self.router.registry().register(&service_name);

        Ok(service_name)
    }

    /// Wait for tor to materialize the hostname file, then read the
    /// generated onion address from it.
    async fn read_hostname(
        &self,
        dir_name: &str,
        hostname_file: &Path,
        observer: Option<WriteObserver>,
    ) -> Result<String, RegistryError> {
        if !hostname_file.exists() {
            let written = match observer {
                Some(observer) => observer.wait(HOSTNAME_TIMEOUT).await,
                None => false,
            };
            if !written && !hostname_file.exists() {
                return Err(RegistryError::HostnameTimeout(dir_name.to_string()));
            }
        }
        let hostname = tokio::fs::read_to_string(hostname_file).await?;
        Ok(hostname.trim().to_string())
    }

    /// Withdraw a hidden service. Safe to call for a service that never
    /// became ready; whatever directive exists is removed.
    pub(crate) async fn unpublish_hidden_service(
        &self,
        dir_name: &str,
    ) -> Result<(), RegistryError> {
        let (removed, pairs, none_left) = {
            let mut services = self.services.lock().expect("service table");
            let removed = services.remove(dir_name);
            (removed, directive_pairs(&services), services.is_empty())
        };
        let Some(removed) = removed else {
            return Ok(());
        };

        // Drop pending ready listeners first so none fire mid-unpublish.
        if !removed.service_name.is_empty() {
            self.router.registry().remove(&removed.service_name);
        }

        let result = if none_left {
            self.control
                .reset_conf("HiddenServiceDir HiddenServicePort")
                .await
        } else {
            self.control.set_conf_pairs(&pairs).await
        };
        result.map_err(RegistryError::Publish)
    }

    /// Whether the daemon reports a completed bootstrap.
    pub async fn bootstrapped(&self) -> io::Result<bool> {
        self.control.bootstrapped().await
    }

    /// Stop the daemon: disable networking, request termination, close the
    /// owning control connection, and sweep the working directory (hidden
    /// service keys are preserved). A second call fails with a clean
    /// "session closed" error and performs no cleanup.
    pub async fn shutdown(&self) -> io::Result<()> {
        self.control.shutdown().await?;

        // The daemon needs a moment to notice and exit before its files go.
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        if let Err(e) = install::clean_except_hidden_services(&self.workdir).await {
            warn!("cleanup after shutdown failed: {}", e);
        }
        Ok(())
    }
}

/// HiddenServiceDir/HiddenServicePort pairs for every active service; the
/// whole set is rewritten on each change because the daemon treats the
/// directives as one configuration block.
fn directive_pairs(services: &HashMap<String, PublishedService>) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(services.len() * 2);
    for service in services.values() {
        pairs.push((
            "HiddenServiceDir".to_string(),
            service.dir.display().to_string(),
        ));
        pairs.push((
            "HiddenServicePort".to_string(),
            format!("{} 127.0.0.1:{}", service.service_port, service.local_port),
        ));
    }
    pairs
}

/// Late bootstrap stage: cookie hand-off, control connect, cookie
/// auth, ownership, event subscription.
async fn open_session(
    workdir: &WorkDir,
    cookie_observer: WriteObserver,
    daemon: &mut process::SpawnedDaemon,
    router: Arc<EventRouter>,
) -> Result<ControlSession, BootstrapError> {
    if !cookie_observer.wait(process::COOKIE_TIMEOUT).await {
        return Err(BootstrapError::CookieTimeout);
    }

    let port = daemon.control_port().await?;
    debug!("control listener on port {}", port);

    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(BootstrapError::Control)?;
    let control = ControlSession::open(stream, router);

    let cookie = tokio::fs::read(workdir.cookie_file())
        .await
        .map_err(BootstrapError::Control)?;
    control
        .authenticate(&cookie)
        .await
        .map_err(|e| BootstrapError::Auth(e.to_string()))?;

    // Tie the daemon's lifetime to this connection, then clear the spawn
    // directive so a config reload does not resurrect it.
    control
        .take_ownership()
        .await
        .map_err(BootstrapError::Control)?;
    control
        .reset_conf(process::OWNER_DIRECTIVE)
        .await
        .map_err(BootstrapError::Control)?;
    control
        .set_events(EVENTS)
        .await
        .map_err(BootstrapError::Control)?;

    Ok(control)
}

/// Enable networking, poll until the daemon reports 100% bootstrap, and
/// resolve the SOCKS listener address.
async fn finish_bootstrap(control: &ControlSession) -> Result<SocketAddr, BootstrapError> {
    control
        .enable_network()
        .await
        .map_err(BootstrapError::Control)?;

    let mut ready = false;
    for _ in 0..BOOTSTRAP_MAX_CHECKS {
        if control.bootstrapped().await.map_err(BootstrapError::Control)? {
            ready = true;
            break;
        }
        tokio::time::sleep(BOOTSTRAP_CHECK_INTERVAL).await;
    }
    if !ready {
        return Err(BootstrapError::BootstrapTimeout(
            BOOTSTRAP_CHECK_INTERVAL.as_secs() * u64::from(BOOTSTRAP_MAX_CHECKS),
        ));
    }

    let listeners = control
        .get_info("net/listeners/socks")
        .await
        .map_err(BootstrapError::Control)?;
    parse_socks_listener(&listeners).ok_or_else(|| {
        BootstrapError::Control(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unusable socks listener report: {listeners}"),
        ))
    })
}

/// The GETINFO value is a space-separated list of quoted addresses; the
/// first TCP listener is ours.
fn parse_socks_listener(listeners: &str) -> Option<SocketAddr> {
    listeners
        .split_whitespace()
        .map(|token| token.trim_matches('"'))
        .find_map(|token| token.parse().ok())
}

//! Working-directory layout and support-file installation
//!
//! The daemon runs out of a dedicated working directory containing its
//! executable, the generated torrc, the GeoIP databases, the auth cookie
//! (under a hidden `.tor/` subdirectory) and one subdirectory per published
//! hidden service. Installation is idempotent: stale files from a previous
//! run are deleted before being rewritten.

use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const FILE_TORRC: &str = "torrc";
const FILE_GEOIP: &str = "geoip";
const FILE_GEOIP6: &str = "geoip6";
const FILE_AUTH_COOKIE: &str = ".tor/control_auth_cookie";
const FILE_HOSTNAME: &str = "hostname";
const DIR_HS_ROOT: &str = "hiddenservice";

const DIRECTIVE_COOKIE_AUTH_FILE: &str = "CookieAuthFile ";
const DIRECTIVE_DATA_DIRECTORY: &str = "DataDirectory ";
const DIRECTIVE_GEOIP_FILE: &str = "GeoIPFile ";
const DIRECTIVE_GEOIP6_FILE: &str = "GeoIPv6File ";

/// Default torrc template; runtime directives are appended after it.
const TORRC_TEMPLATE: &str = include_str!("../../resources/torrc");

/// Resolves the fixed set of named support files to their contents.
///
/// Implement this to supply real GeoIP databases or a custom torrc
/// template; [`BundledResources`] provides workable defaults.
pub trait ResourceSource: Send + Sync {
    fn read(&self, name: &str) -> io::Result<Vec<u8>>;
}

/// Built-in resources: the embedded torrc template and empty GeoIP files.
///
/// Tor treats an empty GeoIP database as "no data" and keeps running, so
/// the defaults are enough to bootstrap; country lookups just stay blank.
pub struct BundledResources;

impl ResourceSource for BundledResources {
    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        match name {
            FILE_TORRC => Ok(TORRC_TEMPLATE.as_bytes().to_vec()),
            FILE_GEOIP | FILE_GEOIP6 => Ok(Vec::new()),
            other => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown resource '{other}'"),
            )),
        }
    }
}

/// Resources read from an unpacked Tor distribution directory.
pub struct DirResources {
    root: PathBuf,
}

impl DirResources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResourceSource for DirResources {
    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.root.join(name))
    }
}

/// Path helper for one daemon working directory.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn torrc(&self) -> PathBuf {
        self.root.join(FILE_TORRC)
    }

    pub fn geoip(&self) -> PathBuf {
        self.root.join(FILE_GEOIP)
    }

    pub fn geoip6(&self) -> PathBuf {
        self.root.join(FILE_GEOIP6)
    }

    pub fn cookie_file(&self) -> PathBuf {
        self.root.join(FILE_AUTH_COOKIE)
    }

    /// The tor executable inside the working directory, or plain `tor`
    /// from `PATH` when the directory does not carry its own build.
    pub fn executable(&self) -> PathBuf {
        let name = if cfg!(windows) { "tor.exe" } else { "tor" };
        let bundled = self.root.join(name);
        if bundled.exists() {
            bundled
        } else {
            PathBuf::from(name)
        }
    }

    pub fn hidden_service_root(&self) -> PathBuf {
        self.root.join(DIR_HS_ROOT)
    }

    pub fn hidden_service_dir(&self, name: &str) -> PathBuf {
        self.hidden_service_root().join(name)
    }

    pub fn hostname_file(&self, name: &str) -> PathBuf {
        self.hidden_service_dir(name).join(FILE_HOSTNAME)
    }
}

/// Delete `path` if it exists, then write `contents` to it.
async fn clean_install_one_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {},
        Err(e) if e.kind() == io::ErrorKind::NotFound => {},
        Err(e) => return Err(e),
    }
    tokio::fs::write(path, contents).await
}

/// Install the support files into the working directory.
///
/// Removes leftover torrc files and the stale `.tor` state directory from a
/// previous run, then writes each resource fresh. Safe to call repeatedly.
pub async fn install_files(workdir: &WorkDir, source: &dyn ResourceSource) -> io::Result<()> {
    tokio::fs::create_dir_all(workdir.root()).await?;

    let mut entries = tokio::fs::read_dir(workdir.root()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(FILE_TORRC) && path.is_file() {
            debug!("removing stale config {}", path.display());
            tokio::fs::remove_file(&path).await?;
        }
    }

    let state_dir = workdir.root().join(".tor");
    if state_dir.is_dir() {
        tokio::fs::remove_dir_all(&state_dir).await?;
    }

    clean_install_one_file(&workdir.geoip(), &source.read(FILE_GEOIP)?).await?;
    clean_install_one_file(&workdir.geoip6(), &source.read(FILE_GEOIP6)?).await?;
    clean_install_one_file(&workdir.torrc(), &source.read(FILE_TORRC)?).await?;

    Ok(())
}

/// Append the runtime directives to the installed torrc.
///
/// The GeoIP databases are referenced by file name, not path: tor only
/// resolves them relative to the data directory.
pub async fn append_config(workdir: &WorkDir, bridges: &[String]) -> io::Result<()> {
    let mut conf = tokio::fs::read_to_string(workdir.torrc()).await?;

    conf.push('\n');
    conf.push_str(DIRECTIVE_COOKIE_AUTH_FILE);
    conf.push_str(&workdir.cookie_file().display().to_string());
    conf.push('\n');
    conf.push_str(DIRECTIVE_DATA_DIRECTORY);
    conf.push_str(&workdir.root().display().to_string());
    conf.push('\n');
    conf.push_str(DIRECTIVE_GEOIP_FILE);
    conf.push_str(FILE_GEOIP);
    conf.push('\n');
    conf.push_str(DIRECTIVE_GEOIP6_FILE);
    conf.push_str(FILE_GEOIP6);
    conf.push('\n');

    if !bridges.is_empty() {
        conf.push('\n');
        conf.push_str("UseBridges 1\n");
        for bridge in bridges {
            conf.push_str("Bridge ");
            conf.push_str(bridge);
            conf.push('\n');
        }
    }

    tokio::fs::write(workdir.torrc(), conf).await
}

/// Ensure the cookie file and its parent directory exist before the daemon
/// starts, so the write observer has something to watch.
pub async fn precreate_cookie(workdir: &WorkDir) -> io::Result<()> {
    let cookie = workdir.cookie_file();
    if let Some(parent) = cookie.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if !cookie.exists() {
        tokio::fs::write(&cookie, b"").await?;
    }
    Ok(())
}

/// Remove everything under the working directory except the hidden-service
/// root, preserving onion keys (and therefore addresses) across restarts.
pub async fn clean_except_hidden_services(workdir: &WorkDir) -> io::Result<()> {
    let mut entries = tokio::fs::read_dir(workdir.root()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_dir() {
            if entry.file_name() != DIR_HS_ROOT {
                tokio::fs::remove_dir_all(&path).await?;
            }
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());

        install_files(&workdir, &BundledResources).await.unwrap();
        install_files(&workdir, &BundledResources).await.unwrap();

        assert!(workdir.torrc().is_file());
        assert!(workdir.geoip().is_file());
        assert!(workdir.geoip6().is_file());
    }

    #[tokio::test]
    async fn install_clears_stale_state() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());

        tokio::fs::create_dir_all(dir.path().join(".tor"))
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(".tor/control_auth_cookie"), b"stale")
            .await
            .unwrap();
        tokio::fs::write(workdir.torrc(), b"old").await.unwrap();

        install_files(&workdir, &BundledResources).await.unwrap();

        assert!(!dir.path().join(".tor").exists());
        let conf = tokio::fs::read_to_string(workdir.torrc()).await.unwrap();
        assert_ne!(conf, "old");
    }

    #[tokio::test]
    async fn dir_resources_install_an_unpacked_distribution() {
        let dist = tempfile::tempdir().unwrap();
        std::fs::write(dist.path().join("torrc"), b"SocksPort auto\n").unwrap();
        std::fs::write(dist.path().join("geoip"), b"# v4 db\n").unwrap();
        std::fs::write(dist.path().join("geoip6"), b"# v6 db\n").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        install_files(&workdir, &DirResources::new(dist.path()))
            .await
            .unwrap();

        let conf = tokio::fs::read_to_string(workdir.torrc()).await.unwrap();
        assert_eq!(conf, "SocksPort auto\n");
        let geoip = tokio::fs::read(workdir.geoip()).await.unwrap();
        assert_eq!(geoip, b"# v4 db\n");
    }

    #[tokio::test]
    async fn append_writes_required_directives() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        install_files(&workdir, &BundledResources).await.unwrap();

        append_config(&workdir, &[]).await.unwrap();

        let conf = tokio::fs::read_to_string(workdir.torrc()).await.unwrap();
        assert!(conf.contains("CookieAuthFile "));
        assert!(conf.contains("DataDirectory "));
        assert!(conf.contains("GeoIPFile geoip\n"));
        assert!(conf.contains("GeoIPv6File geoip6\n"));
        assert!(!conf.contains("UseBridges"));
    }

    #[tokio::test]
    async fn append_writes_bridge_lines() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        install_files(&workdir, &BundledResources).await.unwrap();

        let bridges = vec![
            "obfs4 192.0.2.1:443 cert=abc iat-mode=0".to_string(),
            "192.0.2.2:9001".to_string(),
        ];
        append_config(&workdir, &bridges).await.unwrap();

        let conf = tokio::fs::read_to_string(workdir.torrc()).await.unwrap();
        assert!(conf.contains("UseBridges 1\n"));
        assert!(conf.contains("Bridge obfs4 192.0.2.1:443 cert=abc iat-mode=0\n"));
        assert!(conf.contains("Bridge 192.0.2.2:9001\n"));
    }

    #[tokio::test]
    async fn cleanup_preserves_hidden_service_keys() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        install_files(&workdir, &BundledResources).await.unwrap();

        let hs = workdir.hidden_service_dir("test");
        tokio::fs::create_dir_all(&hs).await.unwrap();
        tokio::fs::write(hs.join("hostname"), b"abc.onion\n")
            .await
            .unwrap();

        clean_except_hidden_services(&workdir).await.unwrap();

        assert!(!workdir.torrc().exists());
        assert!(hs.join("hostname").is_file());
    }
}

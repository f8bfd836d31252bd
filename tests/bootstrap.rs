//! Bootstrap failure-path tests
//!
//! These run against a stand-in executable written into the working
//! directory, so no real Tor installation is needed.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use torbind::{BootstrapError, Tor};

/// Drop a fake `tor` executable into the working directory.
fn write_fake_daemon(workdir: &Path, script: &str) {
    std::fs::create_dir_all(workdir).unwrap();
    let exe = workdir.join("tor");
    std::fs::write(&exe, script).unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn missing_cookie_fails_with_cookie_timeout() {
    let dir = tempfile::tempdir().unwrap();
    // Announces a control port but never writes the auth cookie.
    write_fake_daemon(
        dir.path(),
        "#!/bin/sh\necho 'Control listener listening on port 39155.'\nexit 0\n",
    );

    let result = Tor::start(dir.path()).await;

    match result {
        Err(BootstrapError::CookieTimeout) => {},
        other => panic!("expected cookie timeout, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn nonzero_exit_fails_the_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    write_fake_daemon(dir.path(), "#!/bin/sh\necho 'bad config' >&2\nexit 1\n");

    let result = Tor::start(dir.path()).await;

    match result {
        Err(BootstrapError::DaemonExited(status)) => assert!(!status.success()),
        other => panic!("expected daemon-exited error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn install_survives_a_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    write_fake_daemon(
        dir.path(),
        "#!/bin/sh\necho 'Control listener listening on port 39155.'\nexit 0\n",
    );

    // Leave stale state behind, as a crashed run would.
    std::fs::create_dir_all(dir.path().join(".tor")).unwrap();
    std::fs::write(dir.path().join("torrc"), "stale").unwrap();

    let result = Tor::start(dir.path()).await;
    assert!(matches!(result, Err(BootstrapError::CookieTimeout)));

    // The installer rewrote the config before spawning.
    let conf = std::fs::read_to_string(dir.path().join("torrc")).unwrap();
    assert!(conf.contains("CookieAuthFile "));
}

//! Single-file write observer
//!
//! Bridges the `notify` watcher to an async bounded wait. Watching starts
//! when the observer is created, so a write landing between creation and
//! the `wait` call is still seen.

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tracing::debug;

/// Watches one file for creation or modification.
pub struct WriteObserver {
    // Kept alive for the lifetime of the observer; dropping it stops the
    // OS-level watch.
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<()>,
}

impl WriteObserver {
    /// Start observing `file`. The parent directory must exist.
    pub fn new(file: &Path) -> io::Result<Self> {
        let parent = file
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "file has no parent"))?
            .to_path_buf();
        let target: PathBuf = file.to_path_buf();

        let (tx, rx) = mpsc::channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    if event.kind.is_create() || event.kind.is_modify() {
                        if event.paths.iter().any(|p| p == &target) {
                            let _ = tx.send(());
                        }
                    }
                }
            },
            Config::default(),
        )
        .map_err(|e| io::Error::other(format!("failed to create watcher: {e}")))?;

        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| io::Error::other(format!("failed to watch {}: {e}", parent.display())))?;

        debug!("watching {} for writes", file.display());
        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Wait up to `timeout` for a write. Returns whether one was observed.
    pub async fn wait(self, timeout: Duration) -> bool {
        let rx = self.rx;
        tokio::task::spawn_blocking(move || rx.recv_timeout(timeout).is_ok())
            .await
            .unwrap_or(false)
    }
}
